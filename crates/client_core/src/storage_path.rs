//! Naming convention for per-session storage files:
//! `<dir>/session_<name>_<YYYYMMDD_HHMMSS>`.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::error::{SessionError, SessionResult};

const STORAGE_PREFIX: &str = "session_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const TIMESTAMP_LEN: usize = "YYYYMMDD_HHMMSS".len();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageFileName {
    pub session: String,
    pub created_at: NaiveDateTime,
}

pub fn storage_file_name(session: &str, created_at: NaiveDateTime) -> String {
    format!(
        "{STORAGE_PREFIX}{session}_{}",
        created_at.format(TIMESTAMP_FORMAT)
    )
}

pub fn storage_path_for(dir: &Path, session: &str, created_at: NaiveDateTime) -> PathBuf {
    dir.join(storage_file_name(session, created_at))
}

/// Recognizes file names produced by [`storage_file_name`].
pub fn parse_storage_file_name(file_name: &str) -> Option<StorageFileName> {
    let rest = file_name.strip_prefix(STORAGE_PREFIX)?;
    if rest.len() < TIMESTAMP_LEN + 2 || !rest.is_char_boundary(rest.len() - TIMESTAMP_LEN) {
        return None;
    }
    let (head, stamp) = rest.split_at(rest.len() - TIMESTAMP_LEN);
    let session = head.strip_suffix('_')?;
    if session.is_empty() {
        return None;
    }
    let created_at = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Some(StorageFileName {
        session: session.to_owned(),
        created_at,
    })
}

pub fn validate_session_name(name: &str) -> SessionResult<()> {
    let reason = if name.trim().is_empty() {
        Some("name must not be empty")
    } else if name.contains(['/', '\\', '\0']) {
        Some("name must not contain path separators or NUL")
    } else if name.starts_with('.') {
        Some("name must not start with '.'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(SessionError::InvalidName {
            name: name.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .expect("date")
            .and_hms_opt(h, m, s)
            .expect("time")
    }

    #[test]
    fn formats_and_parses_names_with_underscores() {
        let name = storage_file_name("sales_team_2", at(7, 5, 3));
        assert_eq!(name, "session_sales_team_2_20240309_070503");

        let parsed = parse_storage_file_name(&name).expect("parse");
        assert_eq!(parsed.session, "sales_team_2");
        assert_eq!(parsed.created_at, at(7, 5, 3));
    }

    #[test]
    fn rejects_unrelated_files() {
        for candidate in [
            "notes.txt",
            "session_",
            "session__20240309_070503",
            "session_alice_20241309_070503",
            "session_alice_20240309_070503-journal",
            "whatsapp_alice_20240309_070503.db",
        ] {
            assert!(
                parse_storage_file_name(candidate).is_none(),
                "{candidate} should not parse"
            );
        }
    }

    #[test]
    fn validates_session_names() {
        assert!(validate_session_name("6281234567890").is_ok());
        assert!(validate_session_name("ops team").is_ok());
        for bad in ["", "   ", "a/b", "a\\b", ".hidden"] {
            assert!(validate_session_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
