use super::*;
use crate::path::ItemPath;
use crate::permission::PermissionLevel;
use crate::storage::ItemType;
use tempfile::TempDir;

/// Log file that fails on command.
struct FailingFile {
    inner: File,
    /// Bytes accepted before writes start failing.
    write_budget: usize,
    fail_sync: bool,
    fail_truncate: bool,
}

impl FailingFile {
    fn new(inner: File) -> Self {
        Self {
            inner,
            write_budget: usize::MAX,
            fail_sync: false,
            fail_truncate: false,
        }
    }
}

fn disk_full() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "no space left on device")
}

impl Write for FailingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.write_budget == 0 {
            return Err(disk_full());
        }
        let n = buf.len().min(self.write_budget);
        let written = self.inner.write(&buf[..n])?;
        self.write_budget -= written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for FailingFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl LogFile for FailingFile {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        if self.fail_truncate {
            return Err(disk_full());
        }
        self.inner.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        if self.fail_sync {
            return Err(disk_full());
        }
        self.inner.sync_data()
    }
}

fn frame_for(item: &Item) -> Vec<u8> {
    Journal::encode_entry(&JournalEntry {
        sequence: 99,
        timestamp: 0,
        ops: vec![JournalOp::PutItem { item: item.clone() }],
    })
    .unwrap()
}

fn folder(name: &str) -> Item {
    let id = Uuid::new_v4();
    Item::new(
        id,
        ItemPath::root(id),
        name,
        ItemType::Folder,
        serde_json::Value::Null,
        Uuid::new_v4(),
    )
}

#[test]
fn test_journal_append_and_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let item = folder("docs");
    let membership = ItemMembership::new(
        item.path.clone(),
        item.creator_id,
        PermissionLevel::Admin,
        item.creator_id,
    );

    {
        let (journal, existing) = Journal::open(temp_dir.path()).unwrap();
        assert!(existing.is_empty());
        let seq = journal
            .append(vec![
                JournalOp::PutItem { item: item.clone() },
                JournalOp::PutMembership {
                    membership: membership.clone(),
                },
            ])
            .unwrap();
        assert_eq!(seq, 0);
        let seq = journal
            .append(vec![JournalOp::DeleteMembership { id: membership.id }])
            .unwrap();
        assert_eq!(seq, 1);
    }

    let (journal, entries) = Journal::open(temp_dir.path()).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].ops[0], JournalOp::PutItem { item });
    assert_eq!(
        entries[1].ops,
        vec![JournalOp::DeleteMembership { id: membership.id }]
    );
    // sequence continues after the replayed entries
    assert_eq!(journal.append(vec![]).unwrap(), 2);
}

#[test]
fn test_journal_torn_tail_is_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let item = folder("kept");

    {
        let (journal, _) = Journal::open(temp_dir.path()).unwrap();
        journal
            .append(vec![JournalOp::PutItem { item: item.clone() }])
            .unwrap();
    }

    // simulate a crash in the middle of the next frame
    {
        let mut file = OpenOptions::new()
            .append(true)
            .open(temp_dir.path().join(FILE_NAME))
            .unwrap();
        file.write_all(&[0, 0, 1, 0, b'{', b'"']).unwrap();
    }

    {
        let (journal, entries) = Journal::open(temp_dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        journal
            .append(vec![JournalOp::DeleteItem { id: item.id }])
            .unwrap();
    }

    // the frame written after recovery is readable
    let (_, entries) = Journal::open(temp_dir.path()).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].ops, vec![JournalOp::DeleteItem { id: item.id }]);
}

#[test]
fn test_journal_crc_mismatch_stops_replay() {
    let temp_dir = TempDir::new().unwrap();
    {
        let (journal, _) = Journal::open(temp_dir.path()).unwrap();
        journal
            .append(vec![JournalOp::PutItem { item: folder("a") }])
            .unwrap();
        journal
            .append(vec![JournalOp::PutItem { item: folder("b") }])
            .unwrap();
    }

    let path = temp_dir.path().join(FILE_NAME);
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    let (_, entries) = Journal::open(temp_dir.path()).unwrap();
    assert_eq!(entries.len(), 1);
}

#[test]
fn test_journal_rewrite_compacts() {
    let temp_dir = TempDir::new().unwrap();
    let keep = folder("keep");
    {
        let (journal, _) = Journal::open(temp_dir.path()).unwrap();
        for i in 0..5 {
            journal
                .append(vec![JournalOp::PutItem {
                    item: folder(&format!("scratch {}", i)),
                }])
                .unwrap();
        }
        journal
            .rewrite(vec![JournalOp::PutItem { item: keep.clone() }])
            .unwrap();
        journal
            .append(vec![JournalOp::DeleteItem { id: keep.id }])
            .unwrap();
    }

    let (_, entries) = Journal::open(temp_dir.path()).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].ops, vec![JournalOp::PutItem { item: keep.clone() }]);
    assert!(entries[0].sequence < entries[1].sequence);
}

#[test]
fn test_journal_rejects_foreign_file() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join(FILE_NAME), b"NOTAJOURNAL").unwrap();
    assert!(Journal::open(temp_dir.path()).is_err());
}

#[test]
fn test_journal_failed_append_leaves_no_bytes() {
    let temp_dir = TempDir::new().unwrap();
    let first = folder("first");
    let lost = folder("lost");
    let unsynced = folder("unsynced");
    let after = folder("after");

    {
        let (journal, _) = Journal::open(temp_dir.path()).unwrap();
        journal
            .append(vec![JournalOp::PutItem { item: first.clone() }])
            .unwrap();
        let len = std::fs::metadata(journal.path()).unwrap().len();

        // the disk fills up partway through a frame
        let mut short = FailingFile::new(journal.file.lock().try_clone().unwrap());
        short.write_budget = 10;
        assert!(append_frame(&mut short, &frame_for(&lost)).is_err());
        assert_eq!(std::fs::metadata(journal.path()).unwrap().len(), len);

        // the whole frame is written but never reaches the disk
        let mut unsynced_file = FailingFile::new(journal.file.lock().try_clone().unwrap());
        unsynced_file.fail_sync = true;
        assert!(append_frame(&mut unsynced_file, &frame_for(&unsynced)).is_err());
        assert_eq!(std::fs::metadata(journal.path()).unwrap().len(), len);

        let seq = journal
            .append(vec![JournalOp::PutItem { item: after.clone() }])
            .unwrap();
        assert_eq!(seq, 1);
    }

    let (_, entries) = Journal::open(temp_dir.path()).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].ops, vec![JournalOp::PutItem { item: first }]);
    assert_eq!(entries[1].ops, vec![JournalOp::PutItem { item: after }]);
}

#[test]
fn test_journal_poisoned_when_append_cannot_be_undone() {
    let temp_dir = TempDir::new().unwrap();
    let (journal, _) = Journal::open(temp_dir.path()).unwrap();

    let mut stuck = FailingFile::new(journal.file.lock().try_clone().unwrap());
    stuck.write_budget = 3;
    stuck.fail_truncate = true;
    let err = append_frame(&mut stuck, &frame_for(&folder("torn"))).unwrap_err();
    assert!(err.is::<TornAppend>());

    journal.poisoned.store(true, Ordering::SeqCst);
    assert!(journal.append(vec![]).is_err());

    // compaction replaces the file and makes it usable again
    journal.rewrite(vec![]).unwrap();
    assert!(journal.append(vec![]).is_ok());
}
