//! Consent gate.
//!
//! Tracking starts once the visitor has granted either anonymous or full
//! statistics consent. Consent is read from cookies directly so the decision
//! can be made before any consent management script has loaded.

/// Consent category for identified statistics.
pub const STATISTICS: &str = "statistics";

/// Consent category for anonymous statistics.
pub const STATISTICS_ANONYMOUS: &str = "statistics-anonymous";

/// Statistics consent as granted by the visitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsentFlags {
    pub statistics: bool,
    pub statistics_anonymous: bool,
}

impl ConsentFlags {
    /// Both categories granted.
    pub fn all() -> Self {
        Self {
            statistics: true,
            statistics_anonymous: true,
        }
    }

    pub fn allows_tracking(&self) -> bool {
        self.statistics || self.statistics_anonymous
    }

    fn grant(&mut self, category: &str) {
        match category {
            STATISTICS => self.statistics = true,
            STATISTICS_ANONYMOUS => self.statistics_anonymous = true,
            _ => {}
        }
    }
}

/// Read consent from a `document.cookie` style string.
///
/// A category is granted when the cookie `<prefix>_<category>` equals
/// `allow`, or when it is listed in `force_allowed`.
pub fn read_consent_cookies(cookies: &str, prefix: &str, force_allowed: &[String]) -> ConsentFlags {
    let mut flags = ConsentFlags::default();

    for pair in cookies.split(';') {
        let Some((name, value)) = pair.trim().split_once('=') else {
            continue;
        };
        if value.trim() != "allow" {
            continue;
        }
        if let Some(category) = name.trim().strip_prefix(prefix).and_then(|n| n.strip_prefix('_')) {
            flags.grant(category);
        }
    }

    for category in force_allowed {
        flags.grant(category);
    }

    flags
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentState {
    Blocked,
    Active,
}

/// Blocked until consent allows tracking, then active for the life of the
/// client.
#[derive(Debug, Clone)]
pub struct ConsentGate {
    state: ConsentState,
    flags: ConsentFlags,
}

impl ConsentGate {
    pub fn new(flags: ConsentFlags) -> Self {
        let state = if flags.allows_tracking() {
            ConsentState::Active
        } else {
            ConsentState::Blocked
        };
        Self { state, flags }
    }

    /// A gate for deployments without a consent integration.
    pub fn disabled() -> Self {
        Self::new(ConsentFlags::all())
    }

    pub fn state(&self) -> ConsentState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ConsentState::Active
    }

    /// Whether identified user data may be kept.
    pub fn has_full_consent(&self) -> bool {
        self.flags.statistics
    }

    /// Apply a consent change. Returns true when this change activated the
    /// gate. Once active the gate stays active, but the flags keep following
    /// the visitor's choice so full consent can be granted or withdrawn.
    pub fn update(&mut self, flags: ConsentFlags) -> bool {
        self.flags = flags;
        if self.is_active() {
            return false;
        }
        if flags.allows_tracking() {
            self.state = ConsentState::Active;
            return true;
        }
        false
    }
}
