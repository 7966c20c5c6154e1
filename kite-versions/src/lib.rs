//! Per-broker view of which Kafka request keys and versions are supported.
//!
//! A [`VersionTable`] maps each protocol request key to the maximum version
//! the broker supports, with `-1` meaning "not supported at all". Tables are
//! built either from the named release baselines in [`baselines`] or from a
//! live `ApiVersions` response, and are immutable once a connection starts
//! serving.
//!
//! Besides gating requests, the table answers the diagnostic question "what
//! Kafka release is this?": [`VersionTable::guess`] compares the table
//! against every built-in baseline and produces a human-readable label.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod baselines;

pub use baselines::stable;

/// Sentinel version meaning "request key not supported".
pub const UNSUPPORTED: i16 = -1;

/// Max supported version per request key, indexed densely by key.
///
/// Two tables are equal iff their effective prefixes match after trimming
/// trailing [`UNSUPPORTED`] entries; trailing unset keys carry no
/// information (a broker that has never heard of a key and a broker that
/// explicitly disables it look the same on the wire).
#[derive(Debug, Clone, Default)]
pub struct VersionTable {
    k2v: Vec<i16>,
}

impl VersionTable {
    /// Creates a table that supports nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self { k2v: Vec::new() }
    }

    /// Sets the maximum supported version for a request key.
    ///
    /// `version` of [`UNSUPPORTED`] (or any negative value) unsets the key.
    /// Setting a key past the end of the table grows it, filling the gap
    /// with [`UNSUPPORTED`]. Negative keys are ignored.
    pub fn set_max(&mut self, key: i16, version: i16) {
        if key < 0 {
            return;
        }
        let idx = key as usize;
        if idx >= self.k2v.len() {
            self.k2v.resize(idx + 1, UNSUPPORTED);
        }
        self.k2v[idx] = version.max(UNSUPPORTED);
    }

    /// Returns the maximum supported version for a key, or `None` if the
    /// key is unsupported.
    #[must_use]
    pub fn max_version(&self, key: i16) -> Option<i16> {
        if key < 0 {
            return None;
        }
        match self.k2v.get(key as usize) {
            Some(&v) if v >= 0 => Some(v),
            _ => None,
        }
    }

    /// Returns true if the broker supports `version` of `key`.
    #[must_use]
    pub fn supports(&self, key: i16, version: i16) -> bool {
        version >= 0 && self.max_version(key).is_some_and(|max| version <= max)
    }

    /// The table with trailing unset keys trimmed off.
    fn effective(&self) -> &[i16] {
        let mut len = self.k2v.len();
        while len > 0 && self.k2v[len - 1] == UNSUPPORTED {
            len -= 1;
        }
        &self.k2v[..len]
    }

    /// Guesses which Kafka release this table corresponds to.
    ///
    /// The table is compared against each built-in baseline in ascending
    /// release order. Exact matches win; a table that covers a baseline and
    /// sets keys the next release knows reads as "between" the two; extras
    /// even the newest baseline lacks read as a custom build.
    #[must_use]
    pub fn guess(&self) -> String {
        let target = self.effective();
        let all = baselines::all();

        // The newest baseline that the target fully covers: every key the
        // baseline supports is present at the same or a higher version.
        let mut best: Option<usize> = None;

        for (i, (name, baseline)) in all.iter().enumerate() {
            let base = baseline.effective();
            if target == base {
                // Ascending walk: the first exact match is the oldest, so
                // baselines differing only in trailing unset keys resolve
                // to the older name.
                return (*name).to_string();
            }

            let mut missing = false;
            let mut downgraded = false;
            for (key, &base_max) in base.iter().enumerate() {
                if base_max < 0 {
                    continue;
                }
                match target.get(key).copied().unwrap_or(UNSUPPORTED) {
                    v if v < 0 => missing = true,
                    v if v < base_max => downgraded = true,
                    _ => {}
                }
            }
            if !missing && !downgraded {
                best = Some(i);
            }
        }

        let (oldest_name, oldest) = &all[0];
        let (_, newest) = &all[all.len() - 1];

        match best {
            Some(i) => {
                let (name, _) = &all[i];
                if !exceeds(target, newest.effective()) && i + 1 < all.len() {
                    let (next_name, _) = &all[i + 1];
                    format!("between {name} and {next_name}")
                } else {
                    format!("unknown custom version at least {name}")
                }
            }
            // Not even the oldest release is covered. If the table also has
            // nothing the oldest release lacks, it is a pre-release broker;
            // otherwise it is some custom mix.
            None if !exceeds(target, oldest.effective()) => {
                format!("not even {oldest_name}")
            }
            None => "unknown custom version".to_string(),
        }
    }
}

/// True if `target` supports any key or version that `reference` does not.
fn exceeds(target: &[i16], reference: &[i16]) -> bool {
    target.iter().enumerate().any(|(key, &v)| {
        v >= 0 && reference.get(key).copied().unwrap_or(UNSUPPORTED) < v
    })
}

impl PartialEq for VersionTable {
    fn eq(&self, other: &Self) -> bool {
        self.effective() == other.effective()
    }
}

impl Eq for VersionTable {}
