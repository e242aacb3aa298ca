#![cfg(target_os = "linux")]


use std::fs;
use std::os::unix::fs::MetadataExt;

use fuse_common::FuseTestSession;
use nodefuse::raw::Status;
use nodefuse::session::SessionState;

/// Real mount, basic file operations and unmount
#[test]
fn test_fuse_real_mount_unmount() {
    let Some(mut session) = FuseTestSession::new(false) else {
        return;
    };
    assert_eq!(session.state.state(), SessionState::Running);
    assert_eq!(session.state.kernel_settings().major, 7);

    fs::write(session.backing.join("from_backing.txt"), "backing content").unwrap();
    let content = fs::read_to_string(session.mountpoint.join("from_backing.txt")).unwrap();
    assert_eq!(content, "backing content");

    fs::write(session.mountpoint.join("through_mount.txt"), "mounted").unwrap();
    assert_eq!(
        fs::read_to_string(session.backing.join("through_mount.txt")).unwrap(),
        "mounted"
    );

    fs::create_dir(session.mountpoint.join("dir")).unwrap();
    fs::rename(
        session.mountpoint.join("through_mount.txt"),
        session.mountpoint.join("dir/moved.txt"),
    )
    .unwrap();
    assert!(session.backing.join("dir/moved.txt").exists());

    let mut names: Vec<String> = fs::read_dir(&session.mountpoint)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["dir".to_string(), "from_backing.txt".to_string()]);

    fs::remove_file(session.mountpoint.join("from_backing.txt")).unwrap();
    assert!(!session.backing.join("from_backing.txt").exists());

    let result = session.unmount().expect("serve thread");
    assert!(result.is_ok(), "serve ended with {:?}", result);
}

/// Hard links report one inode number with client inodes enabled
#[test]
fn test_fuse_real_hardlink_inodes() {
    let Some(session) = FuseTestSession::new(true) else {
        return;
    };

    fs::write(session.backing.join("original"), "shared").unwrap();
    fs::hard_link(
        session.mountpoint.join("original"),
        session.mountpoint.join("link"),
    )
    .unwrap();

    let original = fs::metadata(session.mountpoint.join("original")).unwrap();
    let link = fs::metadata(session.mountpoint.join("link")).unwrap();
    assert_eq!(original.ino(), link.ino());
    assert_eq!(link.nlink(), 2);

    fs::remove_file(session.mountpoint.join("original")).unwrap();
    assert_eq!(
        fs::read_to_string(session.mountpoint.join("link")).unwrap(),
        "shared"
    );
}

/// Cached data is dropped once the engine invalidates the inode
#[test]
fn test_fuse_real_inode_invalidation() {
    let Some(session) = FuseTestSession::new(false) else {
        return;
    };

    let backing_file = session.backing.join("file");
    let mounted_file = session.mountpoint.join("file");
    fs::write(&backing_file, "hello").unwrap();
    assert_eq!(fs::read_to_string(&mounted_file).unwrap(), "hello");

    fs::write(&backing_file, "qqqq").unwrap();
    assert_eq!(session.pathfs.notify("file"), Status::OK);
    assert_eq!(fs::read_to_string(&mounted_file).unwrap(), "qqqq");
}
