use dedarc::archive::{
    append_archive, begin_archive, extract_all, extract_entry, list_entries, open_archive, open_archive_recovering,
};
use dedarc::block::read_block_at;
use dedarc::codec::CodecId;
use dedarc::config::{ArchiveConfig, Method};
use dedarc::dedup::memory::MemoryEstimate;
use dedarc::{ArcError, ArchiveReader, ArchiveWriter, FormatError};
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Seek, SeekFrom, Write};
use tempfile::{tempdir, NamedTempFile};

const METHODS: [Method; 6] = [
    Method::InMemory,
    Method::Cdc,
    Method::GearCdc,
    Method::Digests,
    Method::FutureLz,
    Method::Exhaustive,
];

fn fast_cfg() -> ArchiveConfig {
    ArchiveConfig {
        threads: 2,
        min_match: 64,
        chunk_size: 512,
        max_chunk: 4096,
        solid_block_size: 64 * 1024,
        buf_size: 16 * 1024,
        kdf_iterations: 1,
        kdf_memory_kib: 8,
        ..Default::default()
    }
}

fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x as u8
        })
        .collect()
}

/// Text-like data with plenty of repeats, both near and far.
fn corpus() -> Vec<(String, Vec<u8>)> {
    let base = noise(20_000, 1);
    let mut edited = base.clone();
    edited[5_000..5_100].copy_from_slice(&noise(100, 2));
    vec![
        ("docs/readme.txt".into(), b"dedarc test corpus\n".repeat(300)),
        ("data/base.bin".into(), base),
        ("data/edited.bin".into(), edited),
        ("data/empty".into(), Vec::new()),
        ("one".into(), vec![b'x']),
        ("noise.bin".into(), noise(150_000, 3)),
    ]
}

fn pack(cfg: ArchiveConfig, files: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut w = ArchiveWriter::begin(Cursor::new(Vec::new()), cfg).unwrap();
    for (name, data) in files {
        w.add_entry(name, &data[..], 1_700_000_000).unwrap();
    }
    w.finalize().unwrap().into_inner()
}

fn read_all(bytes: Vec<u8>, password: Option<&str>, files: &[(String, Vec<u8>)]) {
    let mut r = ArchiveReader::open(Cursor::new(bytes), password).unwrap();
    assert_eq!(r.list().len(), files.len());
    for (name, data) in files {
        assert_eq!(&r.read_entry(name).unwrap(), data, "{name}");
    }
}

#[test]
fn test_roundtrip_every_codec_and_method() {
    let files = corpus();
    for codec in CodecId::ALL {
        for method in METHODS {
            let cfg = fast_cfg().with_method(method).with_codec(codec, None);
            read_all(pack(cfg, &files), None, &files);
        }
    }
}

#[test]
fn test_roundtrip_encrypted() {
    let files = corpus();
    for codec in CodecId::ALL {
        for method in METHODS {
            let cfg = fast_cfg().with_method(method).with_codec(codec, None).with_password("pw");
            read_all(pack(cfg, &files), Some("pw"), &files);
        }
    }
}

#[test]
fn test_output_is_deterministic() {
    let files = corpus();
    let one = pack(fast_cfg().with_threads(1), &files);
    let four = pack(fast_cfg().with_threads(4), &files);
    assert_eq!(one, four);
}

#[test]
fn test_path_api_extract_all_matches_directory() {
    let src = tempdir().unwrap();
    let files = corpus();
    for (name, data) in &files {
        let path = src.path().join("tree").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, data).unwrap();
    }

    let archive = NamedTempFile::new().unwrap();
    let mut w = begin_archive(archive.path(), fast_cfg()).unwrap();
    let added = w.add_path(src.path().join("tree")).unwrap();
    assert_eq!(added.len(), files.len());
    w.finalize().unwrap();

    let listed = list_entries(archive.path()).unwrap();
    assert!(listed.iter().all(|e| e.name.starts_with("tree/")));

    let out = tempdir().unwrap();
    let report = extract_all(archive.path(), out.path(), None).unwrap();
    assert!(report.is_clean());
    for e in &listed {
        let bytes = fs::read(out.path().join(&e.name)).unwrap();
        assert_eq!(crc32fast::hash(&bytes), e.crc32, "{}", e.name);
        assert_eq!(bytes.len() as u64, e.size);
    }

    let mut r = open_archive(archive.path(), None).unwrap();
    assert!(r.verify().is_clean());
}

#[test]
fn test_empty_archive_and_empty_entry() {
    let bytes = pack(fast_cfg(), &[]);
    let r = ArchiveReader::open(Cursor::new(bytes), None).unwrap();
    assert!(r.list().is_empty());
    assert!(r.directory().blocks.is_empty());

    let files = vec![("nothing".to_string(), Vec::new())];
    let bytes = pack(fast_cfg(), &files);
    let r = ArchiveReader::open(Cursor::new(bytes.clone()), None).unwrap();
    assert_eq!(r.directory().blocks.len(), 1);
    assert_eq!(r.directory().blocks[0].orig_size, 0);
    read_all(bytes, None, &files);
}

#[test]
fn test_append_of_nothing_keeps_directory() {
    let archive = NamedTempFile::new().unwrap();
    let files = corpus();
    let mut w = begin_archive(archive.path(), fast_cfg()).unwrap();
    for (name, data) in &files {
        w.add_bytes(name, data, 1_700_000_000).unwrap();
    }
    w.finalize().unwrap();
    let before = open_archive(archive.path(), None).unwrap().directory().clone();

    append_archive(archive.path(), fast_cfg()).unwrap().finalize().unwrap();
    let mut r = open_archive(archive.path(), None).unwrap();
    assert_eq!(r.directory(), &before);
    let sessions = r.sessions().unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].prev_directory, sessions[1].directory_offset);
}

#[test]
fn test_append_adds_entries_and_blocks() {
    let archive = NamedTempFile::new().unwrap();
    let mut w = begin_archive(archive.path(), fast_cfg()).unwrap();
    w.add_bytes("first", &noise(5000, 9), 0).unwrap();
    w.finalize().unwrap();

    let cfg = fast_cfg().with_password("second-session");
    let mut w = append_archive(archive.path(), cfg).unwrap();
    w.add_bytes("second", &noise(5000, 10), 0).unwrap();
    w.finalize().unwrap();

    let mut r = open_archive(archive.path(), Some("second-session")).unwrap();
    assert_eq!(r.directory().blocks.len(), 2);
    assert_eq!(r.read_entry("first").unwrap(), noise(5000, 9));
    assert_eq!(r.read_entry("second").unwrap(), noise(5000, 10));
}

#[test]
fn test_locked_archive_refuses_append() {
    let archive = NamedTempFile::new().unwrap();
    let mut w = begin_archive(archive.path(), fast_cfg().locked(true)).unwrap();
    w.add_bytes("a", b"a", 0).unwrap();
    w.finalize().unwrap();
    assert!(matches!(append_archive(archive.path(), fast_cfg()), Err(ArcError::Locked)));
}

#[test]
fn test_similar_files_share_a_block() {
    let a = noise(64 * 1024, 21);
    let mut b = a.clone();
    for region in 0..4 {
        let at = 4_000 + region * 16_000;
        b[at..at + 1_600].copy_from_slice(&noise(1_600, 30 + region as u64));
    }
    let files = vec![("a".to_string(), a), ("b".to_string(), b)];
    let base = ArchiveConfig {
        method: Method::GearCdc,
        codec: CodecId::None,
        level: 0,
        solid_block_size: 1 << 20,
        ..fast_cfg()
    };

    let size_of = |cfg: ArchiveConfig| {
        let r = ArchiveReader::open(Cursor::new(pack(cfg, &files)), None).unwrap();
        r.directory().total_compressed()
    };
    let together = size_of(base.clone());
    let apart = size_of(ArchiveConfig { solid_block_files: Some(1), ..base });
    assert!(together * 5 < apart * 4, "together {together}, apart {apart}");
}

#[test]
fn test_corrupt_block_only_fails_its_entries() {
    let files: Vec<(String, Vec<u8>)> = (0..3).map(|i| (format!("f{i}"), noise(8000, 40 + i))).collect();
    let cfg = ArchiveConfig { solid_block_files: Some(1), ..fast_cfg() };
    let mut bytes = pack(cfg, &files);

    let info = {
        let r = ArchiveReader::open(Cursor::new(bytes.clone()), None).unwrap();
        assert_eq!(r.directory().blocks.len(), 3);
        r.directory().blocks[1]
    };
    let (desc, _) = read_block_at(&mut Cursor::new(&bytes), info.offset).unwrap();
    let target = (info.offset + desc.encoded_len() + desc.comp_size / 2) as usize;
    bytes[target] ^= 0x55;

    let mut r = ArchiveReader::open(Cursor::new(bytes), None).unwrap();
    assert_eq!(r.read_entry("f0").unwrap(), files[0].1);
    assert!(r.read_entry("f1").unwrap_err().is_format());
    assert_eq!(r.read_entry("f2").unwrap(), files[2].1);

    let report = r.verify();
    assert_eq!(report.bad_blocks.len(), 1);
    assert_eq!(report.bad_entries.len(), 1);
    assert_eq!(report.bad_entries[0].0, "f1");
}

#[test]
fn test_wrong_and_missing_password() {
    let files = vec![("secret".to_string(), b"attack at dawn".to_vec())];
    let bytes = pack(fast_cfg().with_password("right"), &files);

    let mut r = ArchiveReader::open(Cursor::new(bytes.clone()), Some("wrong")).unwrap();
    assert!(r.read_entry("secret").unwrap_err().is_authentication());

    let mut r = ArchiveReader::open(Cursor::new(bytes), None).unwrap();
    assert!(matches!(r.read_entry("secret"), Err(ArcError::PasswordRequired { .. })));
}

#[test]
fn test_recovers_previous_session_after_truncated_append() {
    let archive = NamedTempFile::new().unwrap();
    let mut w = begin_archive(archive.path(), fast_cfg()).unwrap();
    w.add_bytes("kept", b"from the first session", 0).unwrap();
    w.finalize().unwrap();

    let stored = ArchiveConfig { codec: CodecId::None, level: 0, ..fast_cfg() };
    let mut w = append_archive(archive.path(), stored).unwrap();
    w.add_bytes("lost", &noise(32 * 1024, 50), 0).unwrap();
    w.finalize().unwrap();

    // Cut the tail off the second session's directory and footer.
    let len = fs::metadata(archive.path()).unwrap().len();
    OpenOptions::new().write(true).open(archive.path()).unwrap().set_len(len - 30).unwrap();

    let Err(err) = open_archive(archive.path(), None) else { panic!("opened a truncated archive") };
    assert!(matches!(err, ArcError::Format(FormatError::FooterNotFound(_))));

    let mut r = open_archive_recovering(archive.path(), None).unwrap();
    assert_eq!(r.list().len(), 1);
    assert_eq!(r.read_entry("kept").unwrap(), b"from the first session");

    // The first session's footer is far outside the trailing window, and the
    // path helpers still find it.
    let first_footer = r.footer_offset();
    assert!(len - 30 - first_footer > 4096);
    let names: Vec<String> = list_entries(archive.path()).unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, ["kept"]);
    let mut out = Vec::new();
    extract_entry(archive.path(), "kept", &mut out, None).unwrap();
    assert_eq!(out, b"from the first session");
}

#[test]
fn test_dict_size_reaches_across_solid_blocks() {
    let unit = noise(32 * 1024, 60);
    let files = vec![("a.bin".to_string(), unit.clone()), ("b.bin".to_string(), unit)];
    let base = ArchiveConfig {
        method: Method::GearCdc,
        codec: CodecId::None,
        level: 0,
        solid_block_size: 32 * 1024,
        ..fast_cfg()
    };

    let packed_size = |cfg: ArchiveConfig| {
        let bytes = pack(cfg, &files);
        let r = ArchiveReader::open(Cursor::new(bytes.clone()), None).unwrap();
        assert_eq!(r.directory().blocks.len(), 2);
        (r.directory().total_compressed(), bytes)
    };

    let (isolated, _) = packed_size(base.clone());
    assert!(isolated > 64 * 1024, "{isolated}");

    let (shared, bytes) = packed_size(base.with_dict_size(Some(1 << 20)));
    assert!(shared < 33 * 1024, "{shared}");
    read_all(bytes.clone(), None, &files);
    let mut r = ArchiveReader::open(Cursor::new(bytes), None).unwrap();
    assert!(r.verify().is_clean());
}

#[test]
fn test_memory_precheck() {
    let cfg = ArchiveConfig { max_memory: Some(1024), ..fast_cfg() };
    match ArchiveWriter::begin(Cursor::new(Vec::new()), cfg) {
        Err(ArcError::Resource(e)) => {
            assert_eq!(e.available, 1024);
            assert!(e.required > e.available);
        }
        other => panic!("expected a resource error, got {:?}", other.err()),
    }
}

#[test]
fn test_spills_block_buffers_to_temp_dir() {
    let spill = tempdir().unwrap();
    let cfg = fast_cfg().with_temp_dir(spill.path());
    let est = MemoryEstimate::for_config(&cfg);
    let budget = est.resident() + (est.total() - est.resident()) / 2;
    let cfg = cfg.with_max_memory(Some(budget));

    let files = corpus();
    read_all(pack(cfg, &files), None, &files);
}

#[test]
fn test_cancel_keeps_fully_flushed_entries() {
    let archive = NamedTempFile::new().unwrap();
    let cfg = ArchiveConfig { solid_block_size: 8 * 1024, ..fast_cfg() };
    let mut w = begin_archive(archive.path(), cfg).unwrap();
    let token = w.cancellation_token();

    let mut added = Vec::new();
    for i in 0..20u64 {
        if i == 12 {
            token.cancel();
        }
        let data = noise(3000, 60 + i);
        match w.add_bytes(&format!("f{i:02}"), &data, 0) {
            Ok(_) => added.push(data),
            Err(ArcError::Cancelled) => break,
            Err(e) => panic!("unexpected {e}"),
        }
    }
    assert_eq!(added.len(), 12);
    assert!(matches!(w.finalize(), Err(ArcError::Cancelled)));

    let mut r = open_archive(archive.path(), None).unwrap();
    let listed = r.list();
    assert!(listed.len() <= added.len());
    for e in listed {
        let i: usize = e.name[1..].parse().unwrap();
        assert_eq!(r.read_entry(&e.name).unwrap(), added[i]);
    }
}

#[test]
fn test_not_an_archive() {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(b"PK\x03\x04 definitely a zip").unwrap();
    let Err(err) = open_archive(f.path(), None) else { panic!("opened a zip file") };
    assert!(matches!(err, ArcError::Format(FormatError::BadSignature(_))));

    let mut file = File::open(f.path()).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    assert!(ArchiveReader::open(file, None).is_err());
}
