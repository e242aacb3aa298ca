//! Inode tree behavior exercised through the raw filesystem interface,
//! without a kernel channel.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

mod common;

use common::dirent_names;
use nodefuse::nodefs::Inode;
use nodefuse::pathfs::PathInode;
use nodefuse::raw::*;
use nodefuse::{
    FileSystemConnector, FileSystemOptions, LoopbackFileSystem, PathNodeFs, PathNodeFsOptions,
    RawFileSystem,
};
use rstest::rstest;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    pathfs: Arc<PathNodeFs>,
    connector: Arc<FileSystemConnector>,
}

fn fixture_with(client_inodes: bool, address_handles: bool) -> Fixture {
    let dir = TempDir::new().unwrap();
    let pathfs = PathNodeFs::new(
        Arc::new(LoopbackFileSystem::new(dir.path())),
        PathNodeFsOptions { client_inodes },
    );
    let connector = if address_handles {
        // Only node ids handed out by this connector are passed back.
        unsafe { FileSystemConnector::new_with_address_handles(pathfs.clone(), FileSystemOptions::default()) }
    } else {
        FileSystemConnector::new(pathfs.clone(), FileSystemOptions::default())
    };
    Fixture {
        dir,
        pathfs,
        connector,
    }
}

fn fixture() -> Fixture {
    fixture_with(false, false)
}

fn header(node_id: u64) -> InHeader {
    InHeader {
        node_id,
        uid: 1000,
        gid: 1000,
        pid: 1,
        ..Default::default()
    }
}

fn lookup(connector: &FileSystemConnector, parent: u64, name: &str) -> Result<EntryOut, Status> {
    let mut out = EntryOut::default();
    match connector.lookup(&header(parent), name, &mut out) {
        Status::OK => Ok(out),
        status => Err(status),
    }
}

fn path_of(inode: &Inode) -> Option<String> {
    inode
        .node()
        .downcast_ref::<PathInode>()
        .expect("not a path node")
        .path()
}

/// Test that lookups are counted and forgets release the node id at zero
#[rstest]
#[case::table(false)]
#[case::address(true)]
fn test_lookup_count_and_forget(#[case] address_handles: bool) {
    let fx = fixture_with(false, address_handles);
    fs::write(fx.dir.path().join("a"), "data").unwrap();

    let first = lookup(&fx.connector, FUSE_ROOT_ID, "a").unwrap();
    let second = lookup(&fx.connector, FUSE_ROOT_ID, "a").unwrap();
    assert_eq!(first.node_id, second.node_id);

    let inode = fx.connector.lookup_node("a").unwrap();
    assert_eq!(inode.lookup_count(), 2);
    assert_eq!(inode.node_id(), first.node_id);

    fx.connector.forget(first.node_id, 1);
    assert_eq!(inode.lookup_count(), 1);
    assert_eq!(fx.connector.known_inode_count(), 1);

    fx.connector.forget(first.node_id, 1);
    assert_eq!(inode.lookup_count(), 0);
    assert_eq!(inode.node_id(), 0);
    assert!(inode.is_dropped());
    assert_eq!(fx.connector.known_inode_count(), 0);
    assert!(fx.connector.lookup_node("a").is_none());
}

/// Test that forgetting more than was looked up is a broken invariant
#[test]
#[should_panic(expected = "underflow")]
fn test_forget_underflow_panics() {
    let fx = fixture();
    fs::write(fx.dir.path().join("a"), "").unwrap();
    let entry = lookup(&fx.connector, FUSE_ROOT_ID, "a").unwrap();
    fx.connector.forget(entry.node_id, 2);
}

/// Test that the root is never forgotten
#[test]
fn test_root_forget_is_ignored() {
    let fx = fixture();
    fx.connector.forget(FUSE_ROOT_ID, 100);
    assert_eq!(fx.connector.root().node_id(), FUSE_ROOT_ID);
    assert!(fx.connector.root().lookup_count() > 0);
}

/// Test that a forgotten directory keeps children the kernel still knows
#[test]
fn test_forgotten_parent_kept_while_child_known() {
    let fx = fixture();
    fs::create_dir(fx.dir.path().join("d")).unwrap();
    fs::write(fx.dir.path().join("d/f"), "").unwrap();

    let dir = lookup(&fx.connector, FUSE_ROOT_ID, "d").unwrap();
    let file = lookup(&fx.connector, dir.node_id, "f").unwrap();

    fx.connector.forget(dir.node_id, 1);
    let d = fx.connector.lookup_node("d").expect("directory still in the tree");
    assert_eq!(d.node_id(), 0);
    assert!(!d.is_dropped());

    fx.connector.forget(file.node_id, 1);
    assert!(fx.connector.lookup_node("d/f").is_none());
    assert_eq!(fx.connector.known_inode_count(), 0);
}

/// Test that concurrent creates each get their own node
#[test]
fn test_concurrent_creates() {
    let fx = fixture();
    let connector = &fx.connector;

    let ids: Vec<u64> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..100)
            .map(|i| {
                s.spawn(move || {
                    let mut out = CreateOut::default();
                    let input = CreateIn {
                        flags: libc::O_WRONLY as u32,
                        mode: 0o644,
                        ..Default::default()
                    };
                    let status = connector.create(&header(FUSE_ROOT_ID), &input, &format!("f{}", i), &mut out);
                    assert_eq!(status, Status::OK);
                    out.entry.node_id
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let distinct: HashSet<u64> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), 100);
    assert!(!distinct.contains(&0));
    assert_eq!(connector.known_inode_count(), 100);
    assert_eq!(fs::read_dir(fx.dir.path()).unwrap().count(), 100);

    let children: HashSet<String> = connector.root().children().into_iter().map(|(n, _)| n).collect();
    assert_eq!(children.len(), 100);

    let mut open = OpenOut::default();
    assert_eq!(connector.opendir(&header(FUSE_ROOT_ID), &OpenIn::default(), &mut open), Status::OK);
    let input = ReadIn {
        fh: open.fh,
        size: 64 * 1024,
        ..Default::default()
    };
    let mut list = DirEntryList::new(input.size as usize, 0);
    assert_eq!(connector.readdir(&header(FUSE_ROOT_ID), &input, &mut list), Status::OK);
    let listed: HashSet<String> = dirent_names(&list.into_bytes())
        .into_iter()
        .filter(|n| n != "." && n != "..")
        .collect();
    let expected: HashSet<String> = (0..100).map(|i| format!("f{}", i)).collect();
    assert_eq!(listed, expected);
    assert_eq!(children, expected);
    connector.releasedir(&header(FUSE_ROOT_ID), &ReleaseIn { fh: open.fh, ..Default::default() });
}

/// Test that rename keeps the node and updates its path
#[test]
fn test_rename_moves_node() {
    let fx = fixture();
    fs::create_dir(fx.dir.path().join("d")).unwrap();
    fs::write(fx.dir.path().join("a"), "x").unwrap();

    let dir = lookup(&fx.connector, FUSE_ROOT_ID, "d").unwrap();
    let file = lookup(&fx.connector, FUSE_ROOT_ID, "a").unwrap();

    let status = fx.connector.rename(
        &header(FUSE_ROOT_ID),
        &RenameIn { newdir: dir.node_id },
        "a",
        "b",
    );
    assert_eq!(status, Status::OK);
    assert!(fx.dir.path().join("d/b").exists());

    let moved = fx.connector.lookup_node("d/b").unwrap();
    assert_eq!(moved.node_id(), file.node_id);
    assert_eq!(path_of(&moved).as_deref(), Some("d/b"));
    assert!(fx.connector.lookup_node("a").is_none());

    let mut attr = AttrOut::default();
    let status = fx
        .connector
        .getattr(&header(file.node_id), &GetAttrIn::default(), &mut attr);
    assert_eq!(status, Status::OK);
    assert_eq!(attr.attr.size, 1);
}

/// Test that an unlinked node answers ENOENT to path operations
#[test]
fn test_unlinked_node_is_deleted() {
    let fx = fixture();
    fs::write(fx.dir.path().join("a"), "").unwrap();
    let entry = lookup(&fx.connector, FUSE_ROOT_ID, "a").unwrap();
    let inode = fx.connector.lookup_node("a").unwrap();

    assert_eq!(fx.connector.unlink(&header(FUSE_ROOT_ID), "a"), Status::OK);
    assert!(!fx.dir.path().join("a").exists());
    assert_eq!(path_of(&inode), None);

    let mut attr = AttrOut::default();
    let status = fx
        .connector
        .getattr(&header(entry.node_id), &GetAttrIn::default(), &mut attr);
    assert_eq!(status, Status::ENOENT);

    // Still known to the kernel until forgotten.
    assert_eq!(inode.lookup_count(), 1);
    fx.connector.forget(entry.node_id, 1);
    assert!(inode.is_dropped());
}

/// Test that hard links share one node in client inode mode
#[test]
fn test_hard_link_shares_node_with_client_inodes() {
    let fx = fixture_with(true, false);
    fs::write(fx.dir.path().join("a"), "shared").unwrap();

    let a = lookup(&fx.connector, FUSE_ROOT_ID, "a").unwrap();
    let mut b = EntryOut::default();
    let status = fx.connector.link(
        &header(FUSE_ROOT_ID),
        &LinkIn { oldnodeid: a.node_id },
        "b",
        &mut b,
    );
    assert_eq!(status, Status::OK);
    assert_eq!(b.node_id, a.node_id);
    assert_eq!(b.attr.nlink, 2);
    assert_eq!(fx.pathfs.client_inode_count(), 1);

    assert_eq!(fx.connector.unlink(&header(FUSE_ROOT_ID), "a"), Status::OK);
    let node = fx.connector.lookup_node("b").unwrap();
    assert_eq!(path_of(&node).as_deref(), Some("b"));

    let mut open = OpenOut::default();
    let status = fx.connector.open(
        &header(a.node_id),
        &OpenIn {
            flags: libc::O_RDONLY as u32,
            unused: 0,
        },
        &mut open,
    );
    assert_eq!(status, Status::OK);
    let mut buf = vec![0u8; 64];
    let read = ReadIn {
        fh: open.fh,
        size: 64,
        ..Default::default()
    };
    let n = fx.connector.read(&header(a.node_id), &read, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"shared");
    fx.connector.release(
        &header(a.node_id),
        &ReleaseIn {
            fh: open.fh,
            ..Default::default()
        },
    );

    fx.connector.forget(a.node_id, 2);
    assert_eq!(fx.pathfs.client_inode_count(), 0);
}

/// Test that without client inodes a hard link is a separate node
#[test]
fn test_hard_link_without_client_inodes() {
    let fx = fixture();
    fs::write(fx.dir.path().join("a"), "").unwrap();

    let a = lookup(&fx.connector, FUSE_ROOT_ID, "a").unwrap();
    let mut b = EntryOut::default();
    let status = fx.connector.link(
        &header(FUSE_ROOT_ID),
        &LinkIn { oldnodeid: a.node_id },
        "b",
        &mut b,
    );
    assert_eq!(status, Status::OK);
    assert_ne!(b.node_id, a.node_id);
    assert_eq!(b.attr.nlink, 2);
}

/// Test grafting a second filesystem and taking it down again
#[test]
fn test_nested_mount_lifecycle() {
    let fx = fixture();
    fs::write(fx.dir.path().join("a"), "").unwrap();
    let other = TempDir::new().unwrap();
    fs::write(other.path().join("inner.txt"), "inner").unwrap();
    let sub = PathNodeFs::new(
        Arc::new(LoopbackFileSystem::new(other.path())),
        PathNodeFsOptions::default(),
    );

    assert_eq!(fx.connector.mount_at("sub", sub.clone(), None), Status::OK);
    assert_eq!(fx.connector.mount_at("sub", sub.clone(), None), Status::EEXIST);

    // A name the kernel already knows cannot be mounted over.
    lookup(&fx.connector, FUSE_ROOT_ID, "a").unwrap();
    assert_eq!(fx.connector.mount_at("a", sub.clone(), None), Status::EEXIST);

    let mount_root = lookup(&fx.connector, FUSE_ROOT_ID, "sub").unwrap();
    assert!(mount_root.attr.is_dir());
    let inner = lookup(&fx.connector, mount_root.node_id, "inner.txt").unwrap();
    assert_eq!(inner.attr.size, 5);

    let status = fx.connector.rename(
        &header(FUSE_ROOT_ID),
        &RenameIn {
            newdir: mount_root.node_id,
        },
        "a",
        "a",
    );
    assert_eq!(status, Status::EXDEV);

    let mut open = OpenOut::default();
    let status = fx.connector.open(
        &header(inner.node_id),
        &OpenIn {
            flags: libc::O_RDONLY as u32,
            unused: 0,
        },
        &mut open,
    );
    assert_eq!(status, Status::OK);
    assert_eq!(fx.connector.unmount_at("sub"), Status::EBUSY);

    fx.connector.release(
        &header(inner.node_id),
        &ReleaseIn {
            fh: open.fh,
            ..Default::default()
        },
    );
    assert_eq!(fx.connector.unmount_at("sub"), Status::OK);
    assert!(fx.connector.lookup_node("sub").is_none());
}

/// Test that only nested mount roots can be unmounted
#[test]
fn test_unmount_requires_nested_mount_root() {
    let fx = fixture();
    fs::write(fx.dir.path().join("a"), "").unwrap();
    lookup(&fx.connector, FUSE_ROOT_ID, "a").unwrap();

    let root = fx.connector.root().clone();
    assert_eq!(fx.connector.unmount(&root), Status::EINVAL);
    let file = fx.connector.lookup_node("a").unwrap();
    assert_eq!(fx.connector.unmount(&file), Status::EINVAL);
    assert_eq!(fx.connector.unmount_at("missing"), Status::ENOENT);
}

/// Test that mounting below a regular file fails
#[test]
fn test_mount_below_file_is_enotdir() {
    let fx = fixture();
    fs::write(fx.dir.path().join("a"), "").unwrap();
    lookup(&fx.connector, FUSE_ROOT_ID, "a").unwrap();
    let other = TempDir::new().unwrap();
    let sub = PathNodeFs::new(
        Arc::new(LoopbackFileSystem::new(other.path())),
        PathNodeFsOptions::default(),
    );
    assert_eq!(fx.connector.mount_at("a/sub", sub, None), Status::ENOTDIR);
}

/// Test mkdir, symlink and readlink through the tree
#[test]
fn test_mkdir_and_symlink() {
    let fx = fixture();

    let mut dir = EntryOut::default();
    let status = fx.connector.mkdir(
        &header(FUSE_ROOT_ID),
        &MkdirIn {
            mode: 0o755,
            umask: 0,
        },
        "d",
        &mut dir,
    );
    assert_eq!(status, Status::OK);
    assert!(dir.attr.is_dir());

    let mut link = EntryOut::default();
    let status = fx
        .connector
        .symlink(&header(dir.node_id), "l", "../target", &mut link);
    assert_eq!(status, Status::OK);
    assert!(link.attr.is_symlink());
    assert_eq!(
        fx.connector.readlink(&header(link.node_id)).unwrap(),
        b"../target"
    );

    assert_eq!(fx.connector.rmdir(&header(FUSE_ROOT_ID), "d"), Status::ENOTEMPTY);
    assert_eq!(fx.connector.unlink(&header(dir.node_id), "l"), Status::OK);
    assert_eq!(fx.connector.rmdir(&header(FUSE_ROOT_ID), "d"), Status::OK);
}

/// Test that setattr applies mode and size and reports the result
#[test]
fn test_setattr_mode_and_size() {
    let fx = fixture();
    fs::write(fx.dir.path().join("a"), "0123456789").unwrap();
    let entry = lookup(&fx.connector, FUSE_ROOT_ID, "a").unwrap();

    let input = SetAttrIn {
        valid: FATTR_MODE | FATTR_SIZE,
        mode: 0o600,
        size: 4,
        ..Default::default()
    };
    let mut out = AttrOut::default();
    let status = fx.connector.setattr(&header(entry.node_id), &input, &mut out);
    assert_eq!(status, Status::OK);
    assert_eq!(out.attr.size, 4);
    assert_eq!(out.attr.mode & 0o777, 0o600);
    assert_eq!(out.attr.ino, entry.node_id);
}

/// Test that a positive negative timeout turns ENOENT into a cacheable entry
#[test]
fn test_negative_entry_when_enabled() {
    let dir = TempDir::new().unwrap();
    let pathfs = PathNodeFs::new(
        Arc::new(LoopbackFileSystem::new(dir.path())),
        PathNodeFsOptions::default(),
    );
    let connector = FileSystemConnector::new(
        pathfs,
        FileSystemOptions {
            negative_timeout: 2.5,
            ..Default::default()
        },
    );

    let entry = lookup(&connector, FUSE_ROOT_ID, "missing").unwrap();
    assert_eq!(entry.node_id, 0);
    assert_eq!(entry.entry_valid, 2);
    assert_eq!(entry.entry_valid_nsec, 500_000_000);
    assert_eq!(connector.known_inode_count(), 0);
}

/// Test that the owner override is applied to every reply
#[test]
fn test_owner_override() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a"), "").unwrap();
    let pathfs = PathNodeFs::new(
        Arc::new(LoopbackFileSystem::new(dir.path())),
        PathNodeFsOptions::default(),
    );
    let connector = FileSystemConnector::new(
        pathfs,
        FileSystemOptions {
            owner: Some(nodefuse::config::Owner { uid: 4242, gid: 4343 }),
            ..Default::default()
        },
    );

    let entry = lookup(&connector, FUSE_ROOT_ID, "a").unwrap();
    assert_eq!(entry.attr.uid, 4242);
    assert_eq!(entry.attr.gid, 4343);
}
