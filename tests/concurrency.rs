use std::thread;
use std::time::Duration;

use zipflow::{AddOptions, MemorySink, MemorySource, Result, Source, ZipReader, ZipWriter};

// Source whose windows arrive slowly, to keep an add in flight while a
// faster one races it.
struct SlowSource {
    inner: MemorySource,
    delay: Duration,
}

impl SlowSource {
    fn new(data: &[u8], delay: Duration) -> Self {
        Self {
            inner: MemorySource::from(data),
            delay,
        }
    }
}

impl Source for SlowSource {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read_window(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        thread::sleep(self.delay);
        self.inner.read_window(offset, length)
    }
}

#[test]
fn concurrent_buffered_adds_land_in_start_order() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();

    thread::scope(|scope| {
        scope.spawn(|| {
            writer
                .add(
                    "first.txt",
                    Some(SlowSource::new(b"slow and early", Duration::from_millis(300))),
                    AddOptions {
                        buffered_write: true,
                        ..AddOptions::default()
                    },
                )
                .unwrap();
        });
        // give the slow add time to reserve its slot
        thread::sleep(Duration::from_millis(100));
        scope.spawn(|| {
            writer
                .add(
                    "second.txt",
                    Some(MemorySource::from(&b"fast and late"[..])),
                    AddOptions {
                        buffered_write: true,
                        ..AddOptions::default()
                    },
                )
                .unwrap();
        });
    });

    let archive = writer.close(None).unwrap().into_bytes();
    let mut reader = ZipReader::new(MemorySource::new(archive)).unwrap();
    let names: Vec<_> = reader.entries().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["first.txt", "second.txt"]);

    // entries appear in the payload region in the same order
    let first = reader.entries()[0].clone();
    let second = reader.entries()[1].clone();
    assert!(first.local_offset < second.local_offset);
    assert_eq!(reader.read_entry(&first).unwrap(), b"slow and early");
    assert_eq!(reader.read_entry(&second).unwrap(), b"fast and late");
}

#[test]
fn failed_add_does_not_disturb_later_adds() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    // empty names are rejected before anything reaches the sink
    assert!(writer
        .add("   ", Some(MemorySource::from(&b"x"[..])), AddOptions::default())
        .is_err());
    // a name that cannot fit its 16-bit length field fails after the slot
    // was reserved; the slot must be released and the turn passed on
    let oversized = "n".repeat(70_000);
    assert!(writer
        .add(&oversized, Some(MemorySource::from(&b"x"[..])), AddOptions::default())
        .is_err());
    writer
        .add(
            "survivor.txt",
            Some(MemorySource::from(&b"still here"[..])),
            AddOptions::default(),
        )
        .unwrap();
    let archive = writer.close(None).unwrap().into_bytes();

    let mut reader = ZipReader::new(MemorySource::new(archive)).unwrap();
    assert_eq!(reader.entries().len(), 1);
    assert_eq!(reader.read_entry_by_name("survivor.txt").unwrap(), b"still here");
}
