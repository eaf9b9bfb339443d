//! Periodic process-tree resource sampling.
//!
//! The sampler owns a persistent [`sysinfo::System`] and, at a fixed
//! cadence, enumerates every live descendant of the child, accumulates the
//! tree-wide resident memory, CPU percent and thread count, and records each
//! PID it has ever seen. The tracked set is owned by the sampler task and
//! handed back through its join handle, so the post-run leak scan reads it
//! strictly after sampling has stopped.

use crate::supervisor::CancelToken;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use sysinfo::{Pid, Process, ProcessesToUpdate, System};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

/// One aggregate measurement across the child and all of its descendants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Seconds since launch, monotonic.
    pub elapsed_secs: f64,
    /// Total resident memory of the tree, in bytes.
    pub memory_bytes: u64,
    /// Summed CPU usage of the tree, in percent of one core.
    pub cpu_percent: f32,
    /// Total thread count of the tree. Outside Linux each process counts as
    /// one thread (no portable per-process thread count exists).
    pub threads: usize,
    /// Number of live descendants at this tick, excluding the child itself.
    pub children: usize,
}

/// Spawn the sampling loop for the tree rooted at `root_pid`.
///
/// The loop ends when `stop` is cancelled or when the root process
/// disappears (natural exit — not an error). The returned handle yields the
/// set of every PID ever observed in the tree.
pub fn spawn_sampler(
    root_pid: u32,
    started: Instant,
    interval: Duration,
    tx: UnboundedSender<Sample>,
    stop: CancelToken,
) -> JoinHandle<HashSet<u32>> {
    tokio::spawn(async move {
        let root = Pid::from_u32(root_pid);
        // Root is tracked before the first sample is ever taken.
        let mut tracked: HashSet<u32> = HashSet::from([root_pid]);
        let mut system = System::new();

        loop {
            if stop.is_cancelled() {
                break;
            }
            system.refresh_processes(ProcessesToUpdate::All, true);
            let Some(root_proc) = system.process(root) else {
                debug!(pid = root_pid, "root process gone, sampling ends");
                break;
            };

            let descendants = descendants_of(&system, root);
            for pid in &descendants {
                tracked.insert(pid.as_u32());
            }

            let mut memory_bytes = root_proc.memory();
            let mut cpu_percent = root_proc.cpu_usage();
            let mut threads = thread_count(root_proc);
            for pid in &descendants {
                // A descendant can vanish between enumeration and measurement;
                // its contribution is simply omitted from this tick.
                let Some(proc) = system.process(*pid) else {
                    continue;
                };
                memory_bytes += proc.memory();
                cpu_percent += proc.cpu_usage();
                threads += thread_count(proc);
            }

            let sample = Sample {
                elapsed_secs: (started.elapsed().as_secs_f64() * 100.0).round() / 100.0,
                memory_bytes,
                cpu_percent,
                threads,
                children: descendants.len(),
            };
            if tx.send(sample).is_err() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.cancelled() => break,
            }
        }
        tracked
    })
}

/// All live descendants of `root`, recursively.
pub fn descendants_of(system: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, proc) in system.processes() {
        if let Some(parent) = proc.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = vec![root];
    let mut seen: HashSet<Pid> = HashSet::from([root]);
    while let Some(current) = queue.pop() {
        if let Some(kids) = children.get(&current) {
            for kid in kids {
                if seen.insert(*kid) {
                    found.push(*kid);
                    queue.push(*kid);
                }
            }
        }
    }
    found
}

#[cfg(target_os = "linux")]
fn thread_count(proc: &Process) -> usize {
    proc.tasks().map_or(1, |tasks| tasks.len().max(1))
}

#[cfg(not(target_os = "linux"))]
fn thread_count(_proc: &Process) -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_descendants_of_finds_spawned_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("spawn sleep");

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let own = Pid::from_u32(std::process::id());
        let descendants = descendants_of(&system, own);
        assert!(
            descendants.contains(&Pid::from_u32(child.id())),
            "spawned sleep should be our descendant"
        );

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_descendants_of_unknown_pid_is_empty() {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        // PID 0 never has enumerable children we could claim.
        let descendants = descendants_of(&system, Pid::from_u32(u32::MAX - 1));
        assert!(descendants.is_empty());
    }

    #[tokio::test]
    async fn test_sampler_tracks_root_and_samples_increase() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stop = CancelToken::new();
        let handle = spawn_sampler(
            pid,
            Instant::now(),
            Duration::from_millis(50),
            tx,
            stop.clone(),
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        stop.cancel();
        let tracked = handle.await.unwrap();

        assert!(tracked.contains(&pid), "root pid is always tracked");

        let mut samples = Vec::new();
        while let Ok(sample) = rx.try_recv() {
            samples.push(sample);
        }
        assert!(samples.len() >= 2, "expected several ticks");
        for pair in samples.windows(2) {
            assert!(
                pair[1].elapsed_secs > pair[0].elapsed_secs,
                "elapsed strictly increases"
            );
        }
        // sleep has no children; memory is the root's own and nonzero.
        assert!(samples.iter().all(|s| s.children == 0));
        assert!(samples.iter().any(|s| s.memory_bytes > 0));

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_sampler_ends_when_root_exits() {
        let mut child = std::process::Command::new("sleep")
            .arg("0.1")
            .spawn()
            .expect("spawn sleep");

        let (tx, _rx) = mpsc::unbounded_channel();
        let stop = CancelToken::new();
        let handle = spawn_sampler(
            child.id(),
            Instant::now(),
            Duration::from_millis(50),
            tx,
            stop,
        );
        child.wait().unwrap();

        // Never cancelled: the loop must end on its own once the root is gone.
        let tracked = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sampler ends after root exit")
            .unwrap();
        assert!(tracked.contains(&child.id()));
    }
}
