//! Named variables carried by messages and refers
//!
//! Names are matched without regard to case. A variable is either received
//! (copied from an incoming request) or outbound (sent as a header when the
//! message or refer leaves through a technology).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub outbound: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarStore {
    vars: Vec<Variable>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.name.eq_ignore_ascii_case(name))
    }

    /// Set, replace or (with an empty value) remove a variable
    pub fn set(&mut self, name: &str, value: &str, outbound: bool) {
        match (self.position(name), value.is_empty()) {
            (Some(index), true) => {
                self.vars.remove(index);
            }
            (Some(index), false) => {
                let var = &mut self.vars[index];
                var.value = value.to_string();
                var.outbound = outbound;
            }
            (None, true) => {}
            (None, false) => self.vars.push(Variable {
                name: name.to_string(),
                value: value.to_string(),
                outbound,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.vars[i].value.as_str())
    }

    /// Remove a variable, returning its value
    pub fn take(&mut self, name: &str) -> Option<String> {
        let index = self.position(name)?;
        Some(self.vars.remove(index).value)
    }

    /// Variables that leave with the message, in the order they were first set
    pub fn outbound(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .iter()
            .filter(|v| v.outbound)
            .map(|v| (v.name.as_str(), v.value.as_str()))
    }

    pub fn received(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .iter()
            .filter(|v| !v.outbound)
            .map(|v| (v.name.as_str(), v.value.as_str()))
    }

    pub fn set_all_outbound(&mut self, outbound: bool) {
        for var in &mut self.vars {
            var.outbound = outbound;
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
