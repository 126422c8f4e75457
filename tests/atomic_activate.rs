use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use rollout::host::HostConfig;
use rollout::release::{ReleaseLayout, ReleaseManager, ReleaseStatus};
use rollout::ssh::SshExecutor;

#[test]
fn readers_never_see_current_missing_during_swaps() {
    let root = tempfile::tempdir().unwrap();
    let deploy_path = root.path().display().to_string();
    let host = HostConfig::new("local", "localhost", "deploy");
    let executor = SshExecutor::default();
    let manager = ReleaseManager::new(&executor, &host, ReleaseLayout::new(&deploy_path));

    manager.prepare().unwrap();
    let mut first = manager.prepare_release().unwrap();
    let mut second = manager.prepare_release().unwrap();
    manager.activate(&mut first).unwrap();
    assert_eq!(first.status, ReleaseStatus::Active);

    let current = root.path().join("current");
    let valid = [first.path.clone(), second.path.clone()];
    let stop = AtomicBool::new(false);
    let reads = AtomicUsize::new(0);

    thread::scope(|scope| {
        scope.spawn(|| {
            while !stop.load(Ordering::SeqCst) {
                let target = fs::read_link(&current).expect("current must always resolve");
                let target = target.display().to_string();
                assert!(valid.contains(&target), "unexpected target {}", target);
                reads.fetch_add(1, Ordering::SeqCst);
            }
        });

        for i in 0..20 {
            let record = if i % 2 == 0 { &mut second } else { &mut first };
            manager.activate(record).unwrap();
        }
        stop.store(true, Ordering::SeqCst);
    });

    assert!(reads.load(Ordering::SeqCst) > 0);
    assert_eq!(fs::read_link(&current).unwrap().display().to_string(), first.path);
}

#[test]
fn activate_reports_the_demoted_release() {
    let root = tempfile::tempdir().unwrap();
    let deploy_path = root.path().display().to_string();
    let host = HostConfig::new("local", "localhost", "deploy");
    let executor = SshExecutor::default();
    let manager = ReleaseManager::new(&executor, &host, ReleaseLayout::new(&deploy_path));

    manager.prepare().unwrap();
    let mut first = manager.prepare_release().unwrap();
    assert!(manager.activate(&mut first).unwrap().is_none());

    let mut second = manager.prepare_release().unwrap();
    let demoted = manager.activate(&mut second).unwrap().unwrap();
    assert_eq!(demoted.id, first.id);
    assert_eq!(demoted.status, ReleaseStatus::Inactive);

    let listed = manager.list().unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[1].active);
    assert_eq!(listed[1].id, second.id);
}

#[test]
fn cleanup_never_removes_the_active_release() {
    let root = tempfile::tempdir().unwrap();
    let deploy_path = root.path().display().to_string();
    let host = HostConfig::new("local", "localhost", "deploy");
    let executor = SshExecutor::default();
    let manager = ReleaseManager::new(&executor, &host, ReleaseLayout::new(&deploy_path));

    manager.prepare().unwrap();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let mut record = manager.prepare_release().unwrap();
        manager.activate(&mut record).unwrap();
        ids.push(record.id);
    }

    let report = manager.cleanup(0).unwrap();
    assert_eq!(report.removed.len(), 2);
    assert!(!report.removed.contains(&ids[2]));
    assert!(root.path().join("releases").join(&ids[2]).is_dir());

    // Nothing left to remove but the active release.
    let report = manager.cleanup(0).unwrap();
    assert!(report.removed.is_empty());
}
