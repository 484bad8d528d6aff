//! CRM and fleet tables.
//!
//! Status columns are free text in the database; values this client does not
//! know about parse as `Other` instead of failing the whole row.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{Resource, ResourceStore};

pub type TaskStore = ResourceStore<Task>;
pub type ProjectStore = ResourceStore<Project>;
pub type MissionStore = ResourceStore<Mission>;
pub type DroneStore = ResourceStore<Drone>;

/// Embedded `name` column from a joined table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRef {
    pub name: String,
}

// =============================================================================
// TASKS
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Joined project, when the row came through the task select.
    #[serde(default, skip_serializing)]
    pub projects: Option<NameRef>,
}

impl Task {
    #[must_use]
    pub fn project_name(&self) -> Option<&str> {
        self.projects.as_ref().map(|p| p.name.as_str())
    }
}

impl Resource for Task {
    const TABLE: &'static str = "tasks";
    const SELECT: &'static str = "*, projects(name)";

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
}

// =============================================================================
// PROJECTS
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Active,
    OnHold,
    Completed,
    Archived,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Resource for Project {
    const TABLE: &'static str = "projects";

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
}

// =============================================================================
// MISSIONS
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    #[default]
    Planned,
    Active,
    Completed,
    Aborted,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: MissionStatus,
    #[serde(default)]
    pub drone_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, skip_serializing)]
    pub drones: Option<NameRef>,
}

impl Mission {
    #[must_use]
    pub fn drone_name(&self) -> Option<&str> {
        self.drones.as_ref().map(|d| d.name.as_str())
    }
}

impl Resource for Mission {
    const TABLE: &'static str = "missions";
    const SELECT: &'static str = "*, drones(name)";

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
}

// =============================================================================
// DRONES
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DroneStatus {
    #[default]
    Idle,
    Flying,
    Charging,
    Maintenance,
    Offline,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drone {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub status: DroneStatus,
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Resource for Drone {
    const TABLE: &'static str = "drones";

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
}

#[cfg(test)]
#[path = "models_test.rs"]
mod tests;
