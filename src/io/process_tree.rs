//! Process tree termination
//!
//! Build tools do not reliably forward signals to their own children, so
//! cancelling a build signals every descendant before the root process.
//! On Windows the whole tree is killed with `taskkill /T`.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// Signal delivered to each process of a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSignal {
    Interrupt,
    Kill,
}

/// Delivers a signal to a single PID
pub trait Signaller {
    fn signal(&self, pid: u32, signal: TreeSignal) -> bool;
}

/// `(pid, parent pid)` pairs for every process on the system
pub type ProcessTable = Vec<(u32, Option<u32>)>;

/// All descendants of `root`, breadth-first
pub fn descendants(root: u32, table: &[(u32, Option<u32>)]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, parent) in table {
        if let Some(parent) = parent {
            if pid != parent {
                children.entry(parent).or_default().push(pid);
            }
        }
    }
    for list in children.values_mut() {
        list.sort_unstable();
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !found.contains(&kid) {
                    found.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    found
}

/// Order in which a tree is signalled: deepest descendants first, root last
pub fn kill_order(root: u32, table: &[(u32, Option<u32>)]) -> Vec<u32> {
    let mut order = descendants(root, table);
    order.reverse();
    order.push(root);
    order
}

/// Signal a whole tree and return the PIDs in the order they were signalled
pub fn signal_tree(
    root: u32,
    table: &[(u32, Option<u32>)],
    signaller: &dyn Signaller,
    signal: TreeSignal,
) -> Vec<u32> {
    let order = kill_order(root, table);
    for &pid in &order {
        let delivered = signaller.signal(pid, signal);
        trace!("Signal {:?} to PID {}: {}", signal, pid, delivered);
    }
    order
}

/// Current process table
pub fn snapshot() -> ProcessTable {
    use sysinfo::{ProcessRefreshKind, RefreshKind, System};

    let system = System::new_with_specifics(
        RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing()),
    );
    system
        .processes()
        .iter()
        .map(|(pid, process)| (pid.as_u32(), process.parent().map(|p| p.as_u32())))
        .collect()
}

/// Signals delivered with `kill(2)`
#[cfg(unix)]
pub struct OsSignaller;

#[cfg(unix)]
impl Signaller for OsSignaller {
    fn signal(&self, pid: u32, signal: TreeSignal) -> bool {
        let signo = match signal {
            TreeSignal::Interrupt => libc::SIGINT,
            TreeSignal::Kill => libc::SIGKILL,
        };
        unsafe { libc::kill(pid as libc::pid_t, signo) == 0 }
    }
}

#[cfg(unix)]
async fn signal_pid_tree(pid: u32, signal: TreeSignal) {
    let table = match tokio::task::spawn_blocking(snapshot).await {
        Ok(table) => table,
        Err(e) => {
            warn!("Process table snapshot failed: {}", e);
            Vec::new()
        }
    };
    let order = signal_tree(pid, &table, &OsSignaller, signal);
    debug!("Sent {:?} to process tree {:?}", signal, order);
}

#[cfg(windows)]
async fn signal_pid_tree(pid: u32, _signal: TreeSignal) {
    let result = tokio::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .output()
        .await;
    match result {
        Ok(output) if output.status.success() => debug!("Killed process tree {}", pid),
        Ok(output) => warn!(
            "taskkill for {} failed: {}",
            pid,
            String::from_utf8_lossy(&output.stderr)
        ),
        Err(e) => warn!("Failed to run taskkill for {}: {}", pid, e),
    }
}

/// Interrupt a process and all its descendants
pub async fn terminate_tree(pid: u32) {
    signal_pid_tree(pid, TreeSignal::Interrupt).await;
}

/// Kill a process and all its descendants
pub async fn kill_tree(pid: u32) {
    signal_pid_tree(pid, TreeSignal::Kill).await;
}

/// Kill one process without touching the runtime (usable from `Drop`)
pub fn kill_pid_sync(pid: u32) {
    #[cfg(unix)]
    {
        OsSignaller.signal(pid, TreeSignal::Kill);
    }
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .output();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(u32, TreeSignal)>>,
    }

    impl Signaller for Recorder {
        fn signal(&self, pid: u32, signal: TreeSignal) -> bool {
            self.sent.lock().unwrap().push((pid, signal));
            true
        }
    }

    // make (100) -> cc1 (101) -> as (103)
    //            -> cc1 (102)
    // unrelated: 200 -> 201
    fn table() -> ProcessTable {
        vec![
            (1, None),
            (100, Some(1)),
            (101, Some(100)),
            (102, Some(100)),
            (103, Some(101)),
            (200, Some(1)),
            (201, Some(200)),
        ]
    }

    #[test]
    fn test_descendants() {
        assert_eq!(descendants(100, &table()), vec![101, 102, 103]);
        assert!(descendants(103, &table()).is_empty());
        assert!(descendants(999, &table()).is_empty());
    }

    #[test]
    fn test_descendants_signalled_before_root() {
        let recorder = Recorder::default();
        let order = signal_tree(100, &table(), &recorder, TreeSignal::Interrupt);

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent.last(), Some(&(100, TreeSignal::Interrupt)));
        for pid in [101, 102, 103] {
            assert!(sent[..3].contains(&(pid, TreeSignal::Interrupt)));
        }
        assert!(!order.contains(&200) && !order.contains(&201));
        // a grandchild goes before its parent
        let pos = |p| order.iter().position(|&x| x == p).unwrap();
        assert!(pos(103) < pos(101));
    }

    #[test]
    fn test_self_parented_entry_does_not_loop() {
        let table = vec![(0, Some(0)), (5, Some(0))];
        assert_eq!(descendants(0, &table), vec![5]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_snapshot_sees_child_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let table = tokio::task::spawn_blocking(snapshot).await.unwrap();
        let me = std::process::id();
        assert!(descendants(me, &table).contains(&pid));

        terminate_tree(pid).await;
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
