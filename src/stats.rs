//! Trace collection counters

use crate::construct::ConstructKind;

/// Read-only snapshot of the coordinator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStatistics {
    pub methods_collected: u64,
    pub constructors_collected: u64,
    pub static_inits_collected: u64,
    pub methods_blacklisted: u64,
    pub constructors_blacklisted: u64,
    pub static_inits_blacklisted: u64,
    pub archives_analyzed: u64,
}

impl TraceStatistics {
    pub fn total_collected(&self) -> u64 {
        self.methods_collected + self.constructors_collected + self.static_inits_collected
    }

    pub fn total_blacklisted(&self) -> u64 {
        self.methods_blacklisted + self.constructors_blacklisted + self.static_inits_blacklisted
    }

    pub(crate) fn count_collected(&mut self, kind: ConstructKind) {
        match kind {
            ConstructKind::Method => self.methods_collected += 1,
            ConstructKind::Constructor => self.constructors_collected += 1,
            ConstructKind::StaticInit => self.static_inits_collected += 1,
            // Type and package coverage records are derived, not counted.
            ConstructKind::Class | ConstructKind::Package => {}
        }
    }

    pub(crate) fn count_blacklisted(&mut self, kind: ConstructKind) {
        match kind {
            ConstructKind::Method => self.methods_blacklisted += 1,
            ConstructKind::Constructor => self.constructors_blacklisted += 1,
            ConstructKind::StaticInit => self.static_inits_blacklisted += 1,
            ConstructKind::Class | ConstructKind::Package => {}
        }
    }
}
