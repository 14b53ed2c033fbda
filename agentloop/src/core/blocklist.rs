//! Command blocklist checks.

use std::collections::BTreeSet;

/// Commands the model may not run directly.
///
/// - `general` entries block on the leading token, whatever follows.
/// - `standalone` entries block only when the whole trimmed action is the name
///   (e.g. a bare `vim` is blocked but `vim -c ...` is allowed).
///
/// The exempt name (the submit command) is never blocked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blocklist {
    general: BTreeSet<String>,
    standalone: BTreeSet<String>,
    exempt: Option<String>,
}

impl Blocklist {
    pub fn new<I, J>(general: I, standalone: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        Self {
            general: general.into_iter().collect(),
            standalone: standalone.into_iter().collect(),
            exempt: None,
        }
    }

    pub fn with_exempt(mut self, name: &str) -> Self {
        self.exempt = Some(name.to_string());
        self
    }

    /// The leading token of `action` if it is blocked.
    pub fn blocked_name<'a>(&self, action: &'a str) -> Option<&'a str> {
        let trimmed = action.trim();
        let name = trimmed.split_whitespace().next()?;
        if self.exempt.as_deref() == Some(name) {
            return None;
        }
        if self.general.contains(name) {
            return Some(name);
        }
        if self.standalone.contains(name) && name == trimmed {
            return Some(name);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocklist() -> Blocklist {
        Blocklist::new(
            ["vim".to_string(), "nano".to_string()],
            ["python".to_string(), "bash".to_string()],
        )
        .with_exempt("submit")
    }

    #[test]
    fn general_entries_block_with_arguments() {
        assert_eq!(blocklist().blocked_name("vim foo.py"), Some("vim"));
        assert_eq!(blocklist().blocked_name("  nano\n"), Some("nano"));
    }

    #[test]
    fn standalone_entries_block_only_exact_action() {
        let b = blocklist();
        assert_eq!(b.blocked_name(" python \n"), Some("python"));
        assert_eq!(b.blocked_name("python script.py"), None);
    }

    #[test]
    fn empty_and_unlisted_actions_pass() {
        assert_eq!(blocklist().blocked_name("   "), None);
        assert_eq!(blocklist().blocked_name("ls -la"), None);
        assert_eq!(blocklist().blocked_name("vimdiff a b"), None);
    }

    #[test]
    fn exempt_name_is_never_blocked() {
        let b = Blocklist::new(["submit".to_string()], ["submit".to_string()]).with_exempt("submit");
        assert_eq!(b.blocked_name("submit"), None);
    }
}
