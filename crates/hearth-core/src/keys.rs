// ABOUTME: Naming scheme for primary snapshot keys and their backup keys.
// ABOUTME: Backup keys embed a zero-padded creation time so lexicographic order is creation order.

/// Width of the epoch-millisecond suffix on backup keys. Thirteen digits
/// covers every timestamp until the year 2286.
const MILLIS_WIDTH: usize = 13;

/// The key namespace of one application, e.g. prefix `notes` gives
/// `notes_state` for the primary snapshot and `notesbackup_state_<ms>` for
/// its backups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `<prefix>_<name>`
    pub fn primary(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }

    /// Prefix shared by every primary key in this namespace.
    pub fn primary_prefix(&self) -> String {
        format!("{}_", self.prefix)
    }

    /// `<prefix>backup_<name>_`, the scan prefix for one name's backups.
    pub fn backup_prefix(&self, name: &str) -> String {
        format!("{}backup_{}_", self.prefix, name)
    }

    /// `<prefix>backup_<name>_<createdAtEpochMs>`
    pub fn backup(&self, name: &str, created_at_ms: i64) -> String {
        format!(
            "{}{:0width$}",
            self.backup_prefix(name),
            created_at_ms.max(0),
            width = MILLIS_WIDTH
        )
    }

    /// True if `key` is a backup of exactly `name` (not of a longer name
    /// that happens to share the prefix, like `state_old`).
    pub fn is_backup_of(&self, name: &str, key: &str) -> bool {
        key.strip_prefix(&self.backup_prefix(name))
            .is_some_and(is_millis)
    }

    /// Split a backup key into its name and creation time.
    pub fn parse_backup<'a>(&self, key: &'a str) -> Option<(&'a str, i64)> {
        let rest = key
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix("backup_")?;
        let (name, millis) = rest.rsplit_once('_')?;
        if name.is_empty() || !is_millis(millis) {
            return None;
        }
        Some((name, millis.parse().ok()?))
    }
}

/// True if `part` may be used as a prefix or name: non-empty ASCII letters,
/// digits, `_` and `-`. Every medium accepts keys built from such parts.
pub fn is_valid_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// A backup suffix: at most `MILLIS_WIDTH` digits.
fn is_millis(text: &str) -> bool {
    !text.is_empty() && text.len() <= MILLIS_WIDTH && text.bytes().all(|b| b.is_ascii_digit())
}
