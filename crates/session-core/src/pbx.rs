//! Dialplan routing seam

use std::collections::HashMap;

use parking_lot::RwLock;

/// Extension lookups the session and message layers route against
pub trait Dialplan: Send + Sync {
    /// An extension with exactly this name exists in `context`
    fn exists_extension(&self, context: &str, exten: &str) -> bool;

    /// `exten` matches or is a prefix of some extension in `context`
    fn can_match_extension(&self, context: &str, exten: &str) -> bool;
}

/// In-memory dialplan of literal extensions per context
#[derive(Debug, Default)]
pub struct StaticDialplan {
    contexts: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticDialplan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension(self, context: &str, exten: &str) -> Self {
        self.add_extension(context, exten);
        self
    }

    pub fn add_extension(&self, context: &str, exten: &str) {
        self.contexts
            .write()
            .entry(context.to_string())
            .or_default()
            .push(exten.to_string());
    }
}

impl Dialplan for StaticDialplan {
    fn exists_extension(&self, context: &str, exten: &str) -> bool {
        self.contexts
            .read()
            .get(context)
            .is_some_and(|extens| extens.iter().any(|e| e == exten))
    }

    fn can_match_extension(&self, context: &str, exten: &str) -> bool {
        self.contexts
            .read()
            .get(context)
            .is_some_and(|extens| extens.iter().any(|e| e.starts_with(exten)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_partial_matches() {
        let plan = StaticDialplan::new().with_extension("default", "1000");
        assert!(plan.exists_extension("default", "1000"));
        assert!(!plan.exists_extension("default", "100"));
        assert!(plan.can_match_extension("default", "100"));
        assert!(!plan.can_match_extension("default", "2"));
        assert!(!plan.exists_extension("other", "1000"));
    }
}
