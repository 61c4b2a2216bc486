//! Process-lifetime signal name table.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::ProcmuxError;

const SIGNALS: &[(&str, i32)] = &[
    ("SIGHUP", 1),
    ("SIGINT", 2),
    ("SIGQUIT", 3),
    ("SIGILL", 4),
    ("SIGTRAP", 5),
    ("SIGABRT", 6),
    ("SIGBUS", 7),
    ("SIGFPE", 8),
    ("SIGKILL", 9),
    ("SIGUSR1", 10),
    ("SIGSEGV", 11),
    ("SIGUSR2", 12),
    ("SIGPIPE", 13),
    ("SIGALRM", 14),
    ("SIGTERM", 15),
    ("SIGCHLD", 17),
    ("SIGCONT", 18),
    ("SIGSTOP", 19),
    ("SIGTSTP", 20),
    ("SIGTTIN", 21),
    ("SIGTTOU", 22),
    ("SIGURG", 23),
    ("SIGXCPU", 24),
    ("SIGXFSZ", 25),
    ("SIGVTALRM", 26),
    ("SIGPROF", 27),
    ("SIGWINCH", 28),
    ("SIGIO", 29),
    ("SIGSYS", 31),
];

fn by_name() -> &'static HashMap<&'static str, i32> {
    static TABLE: OnceLock<HashMap<&'static str, i32>> = OnceLock::new();
    TABLE.get_or_init(|| SIGNALS.iter().copied().collect())
}

fn by_number() -> &'static HashMap<i32, &'static str> {
    static TABLE: OnceLock<HashMap<i32, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| SIGNALS.iter().map(|(name, num)| (*num, *name)).collect())
}

/// A signal given either by name (`"SIGTERM"`) or number (`15`).
#[derive(Debug, Clone, PartialEq, Eq, derive_more::From)]
pub enum KillSignal {
    #[from]
    Number(i32),
    Name(String),
}

impl Default for KillSignal {
    fn default() -> Self {
        KillSignal::Name("SIGTERM".to_string())
    }
}

impl From<&str> for KillSignal {
    fn from(name: &str) -> Self {
        KillSignal::Name(name.to_string())
    }
}

impl From<String> for KillSignal {
    fn from(name: String) -> Self {
        KillSignal::Name(name)
    }
}

/// Resolve a signal to its number through the table.
///
/// Signal `0` (the liveness probe) is deliberately not special-cased here;
/// callers that support probing bypass resolution entirely.
pub fn resolve(signal: &KillSignal) -> Result<i32, ProcmuxError> {
    match signal {
        KillSignal::Number(num) => {
            if by_number().contains_key(num) {
                Ok(*num)
            } else {
                Err(ProcmuxError::UnknownSignal(num.to_string()))
            }
        }
        KillSignal::Name(name) => by_name()
            .get(name.as_str())
            .copied()
            .ok_or_else(|| ProcmuxError::UnknownSignal(name.clone())),
    }
}

/// Signal name for a number, if the table knows it.
pub fn name_of(signo: i32) -> Option<&'static str> {
    by_number().get(&signo).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_names_and_numbers() {
        assert_eq!(resolve(&KillSignal::from("SIGTERM")).unwrap(), 15);
        assert_eq!(resolve(&KillSignal::from("SIGKILL")).unwrap(), 9);
        assert_eq!(resolve(&KillSignal::from(2)).unwrap(), 2);
    }

    #[test]
    fn unknown_signal_is_rejected() {
        assert!(matches!(
            resolve(&KillSignal::from("SIGBOGUS")),
            Err(ProcmuxError::UnknownSignal(_))
        ));
        assert!(matches!(
            resolve(&KillSignal::from(999)),
            Err(ProcmuxError::UnknownSignal(_))
        ));
    }

    #[test]
    fn number_round_trip() {
        for (name, num) in SIGNALS {
            assert_eq!(name_of(*num), Some(*name));
            assert_eq!(resolve(&KillSignal::from(*name)).unwrap(), *num);
        }
    }

    #[test]
    fn default_is_sigterm() {
        assert_eq!(resolve(&KillSignal::default()).unwrap(), 15);
    }
}
