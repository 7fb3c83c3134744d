use zipflow::{
    AddOptions, ExtractOptions, MemorySink, MemorySource, ReaderOptions, ZipError, ZipReader,
    ZipWriter,
};

fn write_single(name: &str, payload: &[u8], options: AddOptions<'_>) -> Vec<u8> {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    writer
        .add(name, Some(MemorySource::from(payload)), options)
        .unwrap();
    writer.close(None).unwrap().into_bytes()
}

fn read_single(archive: Vec<u8>, name: &str, password: Option<&str>) -> Vec<u8> {
    let mut reader = ZipReader::with_options(
        MemorySource::new(archive),
        ReaderOptions {
            password: password.map(str::to_string),
        },
    )
    .unwrap();
    reader.read_entry_by_name(name).unwrap()
}

#[test]
fn roundtrip_across_the_policy_matrix() {
    let payload: Vec<u8> = b"The quick brown fox jumps over the lazy dog. ".repeat(100);
    for compressed in [false, true] {
        for encrypted in [false, true] {
            let options = AddOptions {
                level: if compressed { 6 } else { 0 },
                password: encrypted.then(|| "tr0ub4dor".to_string()),
                ..AddOptions::default()
            };
            let archive = write_single("fox.txt", &payload, options);
            let restored = read_single(archive, "fox.txt", encrypted.then_some("tr0ub4dor"));
            assert_eq!(restored, payload, "compressed={compressed} encrypted={encrypted}");
        }
    }
}

#[test]
fn stored_hello_layout_and_signature() {
    let archive = write_single(
        "hello.txt",
        b"Hello",
        AddOptions {
            level: 0,
            ..AddOptions::default()
        },
    );

    // local header (30 + 9) + stored payload (5) + descriptor (16) = 60,
    // directory record 46 + 9 = 55, EOCD 22
    assert_eq!(archive.len(), 137);
    assert_eq!(&archive[0..4], &[0x50, 0x4B, 0x03, 0x04]);
    assert_eq!(&archive[60..64], &[0x50, 0x4B, 0x01, 0x02]);
    assert_eq!(&archive[115..119], &[0x50, 0x4B, 0x05, 0x06]);

    let mut reader = ZipReader::new(MemorySource::new(archive)).unwrap();
    let entry = reader.entries()[0].clone();
    assert_eq!(entry.name, "hello.txt");
    assert_eq!(entry.crc32, 0xF7D18982);
    assert_eq!(entry.compression_method, 0);
    assert_eq!(entry.compressed_size, 5);
    assert_eq!(entry.uncompressed_size, 5);
    assert_eq!(reader.read_entry(&entry).unwrap(), b"Hello");
}

#[test]
fn eocd_is_found_behind_a_large_archive_comment() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    writer
        .add(
            "a.txt",
            Some(MemorySource::from(&b"payload"[..])),
            AddOptions::default(),
        )
        .unwrap();
    let comment = "c".repeat(40_000);
    let archive = writer.close(Some(&comment)).unwrap().into_bytes();

    let mut reader = ZipReader::new(MemorySource::new(archive)).unwrap();
    assert_eq!(reader.comment().len(), 40_000);
    assert_eq!(reader.entries().len(), 1);
    assert_eq!(reader.read_entry_by_name("a.txt").unwrap(), b"payload");
}

#[test]
fn utf8_flag_selects_utf8_names() {
    let archive = write_single("☃", b"snow", AddOptions::default());
    let mut reader = ZipReader::new(MemorySource::new(archive)).unwrap();
    let entry = reader.entries()[0].clone();
    assert_eq!(entry.raw_name, [0xE2, 0x98, 0x83]);
    assert_ne!(entry.flags & 0x0800, 0);
    assert_eq!(entry.name, "☃");
    assert_eq!(entry.compression_method, 8);
    assert_eq!(reader.read_entry(&entry).unwrap(), b"snow");
}

#[test]
fn cp437_comment_byte_0x80_decodes_to_c_cedilla() {
    let marker = "Q1987654321";
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    writer
        .add(
            "plain.txt",
            Some(MemorySource::from(&b"data"[..])),
            AddOptions {
                comment: Some(marker.to_string()),
                ..AddOptions::default()
            },
        )
        .unwrap();
    let mut archive = writer.close(None).unwrap().into_bytes();

    // overwrite the first comment byte with 0x80; bit 11 is clear, so the
    // comment decodes through CP437
    let pos = archive
        .windows(marker.len())
        .position(|window| window == marker.as_bytes())
        .unwrap();
    archive[pos] = 0x80;

    let reader = ZipReader::new(MemorySource::new(archive)).unwrap();
    let entry = &reader.entries()[0];
    assert_eq!(entry.flags & 0x0800, 0);
    assert_eq!(entry.comment, format!("\u{00C7}{}", &marker[1..]));
}

#[test]
fn duplicate_add_fails_and_keeps_the_first_entry() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    writer
        .add(
            "a.txt",
            Some(MemorySource::from(&b"original"[..])),
            AddOptions::default(),
        )
        .unwrap();
    let err = writer
        .add(
            "a.txt",
            Some(MemorySource::from(&b"impostor"[..])),
            AddOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, ZipError::DuplicatedName(_)));

    let archive = writer.close(None).unwrap().into_bytes();
    let mut reader = ZipReader::new(MemorySource::new(archive)).unwrap();
    assert_eq!(reader.entries().len(), 1);
    assert_eq!(reader.read_entry_by_name("a.txt").unwrap(), b"original");
}

#[test]
fn tampered_signed_payload_fails_with_invalid_signature() {
    let payload = b"stored but signed payload";
    let mut archive = write_single(
        "victim.bin",
        payload,
        AddOptions {
            level: 0,
            ..AddOptions::default()
        },
    );

    // stored payload sits right after the 30 + 10 byte local header
    let data_offset = 30 + "victim.bin".len();
    archive[data_offset + 3] ^= 0x40;

    let mut reader = ZipReader::new(MemorySource::new(archive)).unwrap();
    let entry = reader.entries()[0].clone();
    let err = reader.read_entry(&entry).unwrap_err();
    assert!(matches!(err, ZipError::InvalidSignature(_)));
}

#[test]
fn tampered_aes_ciphertext_fails_with_invalid_signature() {
    let mut archive = write_single(
        "vault.bin",
        b"ciphertext integrity matters",
        AddOptions {
            level: 0,
            password: Some("pw".to_string()),
            ..AddOptions::default()
        },
    );

    // flip one ciphertext byte past the salt and verification prefix
    let data_offset = 30 + "vault.bin".len() + 11; // header + name + AES extra
    archive[data_offset + 18 + 2] ^= 0x01;

    let mut reader = ZipReader::with_options(
        MemorySource::new(archive),
        ReaderOptions {
            password: Some("pw".to_string()),
        },
    )
    .unwrap();
    let entry = reader.entries()[0].clone();
    let err = reader.read_entry(&entry).unwrap_err();
    assert!(matches!(err, ZipError::InvalidSignature(_)));
}

#[test]
fn missing_and_wrong_passwords_are_distinct_errors() {
    let archive = write_single(
        "secret.txt",
        b"classified",
        AddOptions {
            password: Some("right".to_string()),
            ..AddOptions::default()
        },
    );

    let mut reader = ZipReader::new(MemorySource::new(archive.clone())).unwrap();
    let entry = reader.entries()[0].clone();
    assert!(entry.encrypted);
    assert_eq!(entry.crc32, 0, "AE-2 stores a zero CRC");
    assert_eq!(entry.stored_method, 0x63);
    assert!(matches!(
        reader.read_entry(&entry).unwrap_err(),
        ZipError::Encrypted
    ));

    let err = reader
        .read_entry_with(
            &entry,
            ExtractOptions {
                password: Some("wrong".to_string()),
                ..ExtractOptions::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, ZipError::InvalidPassword));

    assert_eq!(
        read_single(archive, "secret.txt", Some("right")),
        b"classified"
    );
}

#[test]
fn strength_2_aes_extra_is_rejected_at_parse_time() {
    let mut archive = write_single(
        "secret.txt",
        b"classified",
        AddOptions {
            password: Some("pw".to_string()),
            ..AddOptions::default()
        },
    );

    // patch the strength byte (offset 8 inside the 11-byte 0x9901 block) in
    // both copies of the extra field
    let mut patched = 0;
    let mut pos = 0;
    while pos + 11 <= archive.len() {
        if archive[pos] == 0x01 && archive[pos + 1] == 0x99 && archive[pos + 8] == 3 {
            archive[pos + 8] = 2;
            patched += 1;
        }
        pos += 1;
    }
    assert_eq!(patched, 2);

    let err = ZipReader::new(MemorySource::new(archive)).unwrap_err();
    assert!(matches!(err, ZipError::UnsupportedEncryption(2)));
}

#[test]
fn directories_and_empty_entries_roundtrip() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    writer.add_directory("docs", AddOptions::default()).unwrap();
    writer
        .add("docs/empty.txt", None::<MemorySource>, AddOptions::default())
        .unwrap();
    let archive = writer.close(None).unwrap().into_bytes();

    let mut reader = ZipReader::new(MemorySource::new(archive)).unwrap();
    let dir = reader.entries()[0].clone();
    assert_eq!(dir.name, "docs/");
    assert!(dir.directory);
    assert_ne!(dir.external_attrs & 0x10, 0);
    assert_eq!(dir.uncompressed_size, 0);

    let empty = reader.entries()[1].clone();
    assert!(!empty.directory);
    assert_eq!(reader.read_entry(&empty).unwrap(), b"");
}

#[test]
fn entry_comments_and_caller_extras_roundtrip() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    writer
        .add(
            "annotated.txt",
            Some(MemorySource::from(&b"body"[..])),
            AddOptions {
                comment: Some("made with care".to_string()),
                extra_fields: vec![(0x7075, vec![1, 2, 3, 4])],
                ..AddOptions::default()
            },
        )
        .unwrap();
    let archive = writer.close(None).unwrap().into_bytes();

    let reader = ZipReader::new(MemorySource::new(archive)).unwrap();
    let entry = &reader.entries()[0];
    assert_eq!(entry.comment, "made with care");
    assert_eq!(entry.extra_fields[&0x7075], vec![1, 2, 3, 4]);
}

#[test]
fn extraction_progress_is_monotonic_and_complete() {
    let payload = vec![0xAB; 300_000];
    let archive = write_single("big.bin", &payload, AddOptions::default());

    let mut reader = ZipReader::new(MemorySource::new(archive)).unwrap();
    let entry = reader.entries()[0].clone();
    let mut seen = Vec::new();
    let mut on_progress = |done: u64, total: u64| seen.push((done, total));
    let restored = reader
        .read_entry_with(
            &entry,
            ExtractOptions {
                on_progress: Some(&mut on_progress),
                ..ExtractOptions::default()
            },
        )
        .unwrap();

    assert_eq!(restored, payload);
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|pair| pair[0].0 < pair[1].0));
    let (done, total) = *seen.last().unwrap();
    assert_eq!(done, total);
    assert_eq!(total, entry.compressed_size);
}
