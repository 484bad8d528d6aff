use super::*;

fn drain(rx: &mut broadcast::Receiver<Notice>) -> Vec<Notice> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

#[test]
fn notify_without_listener_is_noop() {
    let notifier = Notifier::new();
    notifier.notify(Notice::Recovered);
}

#[test]
fn listeners_receive_notices_in_order() {
    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();
    notifier.notify(Notice::Recovering { attempt: 1, max: 3 });
    notifier.notify(Notice::Recovered);
    assert_eq!(drain(&mut rx), vec![Notice::Recovering { attempt: 1, max: 3 }, Notice::Recovered]);
}

#[test]
fn connectivity_emits_only_on_transitions() {
    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();
    let monitor = ConnectivityMonitor::new(notifier);

    monitor.observe(true);
    monitor.observe(false);
    monitor.observe(false);
    assert!(!monitor.is_online());
    monitor.observe(true);
    monitor.observe(true);

    assert_eq!(drain(&mut rx), vec![Notice::Offline, Notice::Online]);
    assert!(monitor.is_online());
}
