use super::*;
use serde_json::json;

#[test]
fn task_parses_joined_project_name() {
    let task: Task = serde_json::from_value(json!({
        "id": "t-1",
        "title": "Quarterly review",
        "status": "in_progress",
        "priority": "high",
        "project_id": "p-1",
        "created_at": "2026-04-02T08:00:00Z",
        "projects": { "name": "Launch" }
    }))
    .unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.priority, Priority::High);
    assert_eq!(task.project_name(), Some("Launch"));
    assert_eq!(Task::SELECT, "*, projects(name)");
}

#[test]
fn unknown_status_parses_as_other() {
    let drone: Drone = serde_json::from_value(json!({
        "id": "d-1",
        "name": "Kestrel",
        "status": "quarantined",
        "created_at": "2026-04-02T08:00:00Z"
    }))
    .unwrap();
    assert_eq!(drone.status, DroneStatus::Other);
    assert_eq!(drone.battery_level, None);
}

#[test]
fn mission_without_join_has_no_drone_name() {
    let mission: Mission = serde_json::from_value(json!({
        "id": "m-1",
        "name": "Survey north field",
        "drone_id": null,
        "created_at": "2026-04-02T08:00:00Z"
    }))
    .unwrap();
    assert_eq!(mission.status, MissionStatus::Planned);
    assert!(mission.drone_name().is_none());
}

#[test]
fn missing_created_at_is_rejected() {
    let result = serde_json::from_value::<Project>(json!({ "id": "p-1", "name": "Launch" }));
    assert!(result.is_err());
}

#[test]
fn joined_columns_are_not_written_back() {
    let task: Task = serde_json::from_value(json!({
        "id": "t-1",
        "title": "x",
        "created_at": "2026-04-02T08:00:00Z",
        "projects": { "name": "Launch" }
    }))
    .unwrap();
    let value = serde_json::to_value(&task).unwrap();
    assert!(value.get("projects").is_none());
    assert_eq!(value["status"], "todo");
}
