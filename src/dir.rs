//! Segment directory management: discovery, ordering, selection, atomic
//! initialization, and quarantine of broken directories.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{WalError, WalResult};
use crate::segment::parse_wal_name;

/// True iff the directory holds at least one parseable segment name.
pub fn exist(dir: &Path) -> bool {
    match read_wal_names(dir) {
        Ok(names) => !names.is_empty(),
        Err(_) => false,
    }
}

/// Lists, filters, and sorts the segment basenames in `dir`.
///
/// Unparseable `.wal` names are warned about and skipped; everything else
/// is ignored. An empty result is [`WalError::FileNotFound`].
pub fn read_wal_names(dir: &Path) -> WalResult<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => WalError::FileNotFound,
        _ => WalError::io(dir, source),
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| WalError::io(dir, source))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        match parse_wal_name(&name) {
            Ok(_) => names.push(name),
            Err(_) if name.ends_with(".tmp") => {
                tracing::debug!(name = %name, "ignored temporary file in wal directory");
            }
            Err(_) if name.ends_with(".wal") => {
                tracing::warn!(name = %name, "ignored unparseable file in wal directory");
            }
            Err(_) => {}
        }
    }
    if names.is_empty() {
        return Err(WalError::FileNotFound);
    }
    names.sort();
    Ok(names)
}

/// Index of the newest segment whose first-index is at or below `index`,
/// scanning the sorted names from the tail.
pub fn search_index(names: &[String], index: u64) -> WalResult<Option<usize>> {
    for i in (0..names.len()).rev() {
        let (_, first_index) = parse_wal_name(&names[i])?;
        if first_index <= index {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// Sequence numbers must increase by exactly one across the selected run.
/// The scan only engages once a non-zero sequence has been seen, so a run
/// headed by stray zero-sequence files is not rejected for their sake.
pub fn is_valid_seq(names: &[String]) -> WalResult<bool> {
    let mut last_seq = 0u64;
    for name in names {
        let (seq, _) = parse_wal_name(name)?;
        if last_seq != 0 && seq != last_seq + 1 {
            return Ok(false);
        }
        last_seq = seq;
    }
    Ok(true)
}

/// Picks the scan start for `snap_index`: the names slice stays whole, the
/// returned offset is where reading begins. Fails when no segment covers
/// the index or the covering run has a sequence gap.
pub fn select_wal_files(dir: &Path, names: &[String], snap_index: u64) -> WalResult<usize> {
    let name_index = search_index(names, snap_index)?.ok_or(WalError::FileNotFound)?;
    if !is_valid_seq(&names[name_index..])? {
        return Err(WalError::SeqNotContinuous {
            dir: dir.to_path_buf(),
        });
    }
    Ok(name_index)
}

/// The transient sibling a directory is materialized under before the
/// commit rename.
pub fn tmp_dir_path(dir: &Path) -> PathBuf {
    let mut os = dir.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Prepares an empty private temp directory, clearing the leftovers of an
/// interrupted prior initialization.
pub fn prepare_tmp_dir(dir: &Path) -> WalResult<PathBuf> {
    let tmp = tmp_dir_path(dir);
    if tmp.exists() {
        fs::remove_dir_all(&tmp).map_err(|source| WalError::io(&tmp, source))?;
    }
    fs::create_dir_all(&tmp).map_err(|source| WalError::io(&tmp, source))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o700))
            .map_err(|source| WalError::io(&tmp, source))?;
    }
    Ok(tmp)
}

/// Commits a fully-written temp directory: fsync its contents listing,
/// fsync the parent, rename, fsync the parent again. A crash on either
/// side of the rename leaves a fully old or fully new state.
pub fn commit_tmp_dir(tmp: &Path, dir: &Path) -> WalResult<()> {
    fsync_dir(tmp)?;
    if let Some(parent) = dir.parent() {
        fsync_dir(parent)?;
    }
    fs::rename(tmp, dir).map_err(|source| WalError::io(dir, source))?;
    if let Some(parent) = dir.parent() {
        fsync_dir(parent)?;
    }
    tracing::info!(dir = %dir.display(), "initialized wal directory");
    Ok(())
}

/// Moves a broken directory aside as
/// `<name>.broken.<YYYYMMDD>.<HHMMSS>.<pid>` for postmortem inspection.
pub fn cleanup_wal(dir: &Path) -> WalResult<PathBuf> {
    let stamp = broken_suffix();
    let mut os = dir.as_os_str().to_os_string();
    os.push(format!(".broken.{stamp}.{}", std::process::id()));
    let broken = PathBuf::from(os);
    fs::rename(dir, &broken).map_err(|source| WalError::io(dir, source))?;
    if let Some(parent) = broken.parent() {
        fsync_dir(parent)?;
    }
    tracing::warn!(
        from = %dir.display(),
        to = %broken.display(),
        "moved broken wal directory aside"
    );
    Ok(broken)
}

fn broken_suffix() -> String {
    let now = time::OffsetDateTime::now_utc();
    let format = time::macros::format_description!(
        "[year][month][day].[hour][minute][second]"
    );
    now.format(format)
        .unwrap_or_else(|_| "00000000.000000".to_string())
}

pub fn fsync_dir(dir: &Path) -> WalResult<()> {
    let file = File::open(dir).map_err(|source| WalError::io(dir, source))?;
    file.sync_all()
        .map_err(|source| WalError::io(dir, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::wal_name;
    use tempfile::TempDir;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn search_finds_covering_segment() {
        let cases: &[(&[&str], u64, Option<usize>)] = &[
            (
                &[
                    "0000000000000000-0000000000000000.wal",
                    "0000000000000001-0000000000001000.wal",
                    "0000000000000002-0000000000002000.wal",
                ],
                0x1000,
                Some(1),
            ),
            (
                &[
                    "0000000000000001-0000000000004000.wal",
                    "0000000000000002-0000000000003000.wal",
                    "0000000000000003-0000000000005000.wal",
                ],
                0x4000,
                Some(1),
            ),
            (
                &[
                    "0000000000000001-0000000000002000.wal",
                    "0000000000000002-0000000000003000.wal",
                    "0000000000000003-0000000000005000.wal",
                ],
                0x1000,
                None,
            ),
        ];
        for (names, index, want) in cases {
            let names = strings(names);
            assert_eq!(search_index(&names, *index).unwrap(), *want);
        }
    }

    #[test]
    fn seq_continuity() {
        assert!(is_valid_seq(&strings(&[
            &wal_name(0, 0),
            &wal_name(1, 3),
            &wal_name(2, 9),
        ]))
        .unwrap());
        assert!(!is_valid_seq(&strings(&[
            &wal_name(1, 0),
            &wal_name(3, 9),
        ]))
        .unwrap());
        // zero-headed runs tolerate a leading gap
        assert!(is_valid_seq(&strings(&[&wal_name(0, 0), &wal_name(2, 10)])).unwrap());
    }

    #[test]
    fn select_rejects_gapped_run() {
        let temp = TempDir::new().unwrap();
        let names = strings(&[
            &wal_name(1, 0),
            &wal_name(2, 3),
            &wal_name(4, 9),
        ]);
        let err = select_wal_files(temp.path(), &names, 0).unwrap_err();
        assert!(matches!(err, WalError::SeqNotContinuous { .. }));
        // starting past the gap is fine
        assert_eq!(select_wal_files(temp.path(), &names, 9).unwrap(), 2);
    }

    #[test]
    fn exist_requires_parseable_names() {
        let temp = TempDir::new().unwrap();
        assert!(!exist(temp.path()));

        std::fs::write(temp.path().join("test.wal"), b"junk").unwrap();
        assert!(!exist(temp.path()));

        std::fs::write(temp.path().join(wal_name(0, 0)), b"").unwrap();
        assert!(exist(temp.path()));
    }

    #[test]
    fn read_names_sorts_and_filters() {
        let temp = TempDir::new().unwrap();
        for name in [wal_name(1, 5), wal_name(0, 0), wal_name(2, 9)] {
            std::fs::write(temp.path().join(name), b"").unwrap();
        }
        std::fs::write(temp.path().join("orphan.wal.tmp"), b"").unwrap();
        std::fs::write(temp.path().join("notes.txt"), b"").unwrap();

        let names = read_wal_names(temp.path()).unwrap();
        assert_eq!(
            names,
            vec![wal_name(0, 0), wal_name(1, 5), wal_name(2, 9)]
        );
    }

    #[test]
    fn missing_or_empty_dir_is_file_not_found() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            read_wal_names(temp.path()),
            Err(WalError::FileNotFound)
        ));
        assert!(matches!(
            read_wal_names(&temp.path().join("nope")),
            Err(WalError::FileNotFound)
        ));
    }

    #[test]
    fn cleanup_renames_with_timestamped_suffix() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("member");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join(wal_name(0, 0)), b"").unwrap();

        let broken = cleanup_wal(&dir).unwrap();
        assert!(!dir.exists());
        assert!(broken.exists());
        let name = broken.file_name().unwrap().to_str().unwrap();
        let rest = name.strip_prefix("member.broken.").unwrap();
        let mut parts = rest.split('.');
        let date = parts.next().unwrap();
        let clock = parts.next().unwrap();
        let pid = parts.next().unwrap();
        assert_eq!(date.len(), 8);
        assert_eq!(clock.len(), 6);
        assert!(date.chars().all(|c| c.is_ascii_digit()));
        assert!(clock.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(pid, std::process::id().to_string());
    }

    #[test]
    fn prepare_tmp_clears_stale_leftovers() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("member");
        let tmp = tmp_dir_path(&dir);
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("junk"), b"junk").unwrap();

        let prepared = prepare_tmp_dir(&dir).unwrap();
        assert_eq!(prepared, tmp);
        assert!(std::fs::read_dir(&tmp).unwrap().next().is_none());
    }
}
