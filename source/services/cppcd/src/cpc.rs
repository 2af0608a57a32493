// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU continuous performance control descriptor
//!
//! The table arrives from the firmware parser as a package:
//!
//! ```text
//! [0] NumEntries  = 21
//! [1] Revision    = 2
//! [2..21]         19 entries, each an integer or a register, in CpcField order
//! ```

use nexus_hal::{AddressSpace, RegisterDescriptor};

use crate::CppcError;

/// Entry count announced by a revision 2 table, header included.
pub const CPC_NUM_ENTRIES: u64 = 21;
/// The only supported table revision.
pub const CPC_REVISION: u64 = 2;

const FIELD_COUNT: usize = 19;

/// Fields of the descriptor, in table order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CpcField {
    HighestPerf,
    NominalPerf,
    LowestNonlinearPerf,
    LowestPerf,
    GuaranteedPerf,
    DesiredPerf,
    MinPerf,
    MaxPerf,
    PerfReductionTolerance,
    TimeWindow,
    CounterWraparoundTime,
    ReferenceCounter,
    DeliveredCounter,
    PerfLimited,
    Enable,
    AutoSelectEnable,
    AutoActivityWindow,
    EnergyPerfPreference,
    ReferencePerf,
}

impl CpcField {
    pub const ALL: [CpcField; FIELD_COUNT] = [
        Self::HighestPerf,
        Self::NominalPerf,
        Self::LowestNonlinearPerf,
        Self::LowestPerf,
        Self::GuaranteedPerf,
        Self::DesiredPerf,
        Self::MinPerf,
        Self::MaxPerf,
        Self::PerfReductionTolerance,
        Self::TimeWindow,
        Self::CounterWraparoundTime,
        Self::ReferenceCounter,
        Self::DeliveredCounter,
        Self::PerfLimited,
        Self::Enable,
        Self::AutoSelectEnable,
        Self::AutoActivityWindow,
        Self::EnergyPerfPreference,
        Self::ReferencePerf,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// One descriptor entry: a constant or a register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpcEntry {
    Integer(u64),
    Register(RegisterDescriptor),
}

impl CpcEntry {
    /// Entry of a field the platform does not implement.
    pub const UNSUPPORTED: Self = Self::Integer(0);

    pub fn supported(&self) -> bool {
        match self {
            Self::Integer(value) => *value != 0,
            Self::Register(reg) => !reg.is_null(),
        }
    }

    pub fn register(&self) -> Option<&RegisterDescriptor> {
        match self {
            Self::Register(reg) => Some(reg),
            Self::Integer(_) => None,
        }
    }

    pub fn in_pcc(&self) -> bool {
        self.register().is_some_and(|reg| reg.space == AddressSpace::PlatformComm)
    }
}

/// Performance control description of one logical CPU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpcDescriptor {
    cpu: usize,
    entries: [CpcEntry; FIELD_COUNT],
}

impl CpcDescriptor {
    /// Descriptor with every field unsupported.
    pub fn new(cpu: usize) -> Self {
        Self { cpu, entries: [CpcEntry::UNSUPPORTED; FIELD_COUNT] }
    }

    /// Builds a descriptor from a parsed table, checking its header.
    pub fn from_table(
        cpu: usize,
        num_entries: u64,
        revision: u64,
        entries: &[CpcEntry],
    ) -> Result<Self, CppcError> {
        if num_entries != CPC_NUM_ENTRIES {
            return Err(CppcError::BadTable { cpu, reason: "unsupported entry count" });
        }
        if revision != CPC_REVISION {
            return Err(CppcError::BadTable { cpu, reason: "unsupported revision" });
        }
        let entries: [CpcEntry; FIELD_COUNT] = entries
            .try_into()
            .map_err(|_| CppcError::BadTable { cpu, reason: "entry count disagrees with header" })?;
        Ok(Self { cpu, entries })
    }

    pub fn with(mut self, field: CpcField, entry: CpcEntry) -> Self {
        self.set(field, entry);
        self
    }

    pub fn set(&mut self, field: CpcField, entry: CpcEntry) {
        self.entries[field.index()] = entry;
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn get(&self, field: CpcField) -> &CpcEntry {
        &self.entries[field.index()]
    }

    pub fn supported(&self, field: CpcField) -> bool {
        self.get(field).supported()
    }

    pub fn in_pcc(&self, field: CpcField) -> bool {
        self.get(field).in_pcc()
    }

    /// Implemented register entries.
    pub fn registers(&self) -> impl Iterator<Item = (CpcField, &RegisterDescriptor)> + '_ {
        CpcField::ALL.iter().zip(self.entries.iter()).filter_map(|(field, entry)| {
            entry.register().filter(|reg| !reg.is_null()).map(|reg| (*field, reg))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fields_follow_table_order() {
        assert_eq!(CpcField::HighestPerf.index(), 0);
        assert_eq!(CpcField::DesiredPerf.index(), 5);
        assert_eq!(CpcField::ReferencePerf.index(), 18);
        assert_eq!(CpcField::ALL.len() as u64, CPC_NUM_ENTRIES - 2);
    }

    #[test]
    fn support_rules() {
        assert!(!CpcEntry::UNSUPPORTED.supported());
        assert!(CpcEntry::Integer(5).supported());
        assert!(!CpcEntry::Register(RegisterDescriptor::NULL).supported());
        let pcc = CpcEntry::Register(RegisterDescriptor::platform_comm(0, 32, 0));
        assert!(pcc.supported());
        assert!(pcc.in_pcc());
        assert!(!CpcEntry::Integer(5).in_pcc());
    }

    #[test]
    fn table_header_is_checked() {
        let entries = [CpcEntry::UNSUPPORTED; FIELD_COUNT];
        assert!(CpcDescriptor::from_table(0, 21, 2, &entries).is_ok());
        assert!(matches!(
            CpcDescriptor::from_table(0, 23, 2, &entries),
            Err(CppcError::BadTable { cpu: 0, .. })
        ));
        assert!(matches!(
            CpcDescriptor::from_table(1, 21, 3, &entries),
            Err(CppcError::BadTable { cpu: 1, .. })
        ));
        assert!(matches!(
            CpcDescriptor::from_table(2, 21, 2, &entries[..18]),
            Err(CppcError::BadTable { cpu: 2, .. })
        ));
    }

    #[test]
    fn registers_skips_integers_and_null() {
        let cpc = CpcDescriptor::new(0)
            .with(CpcField::HighestPerf, CpcEntry::Integer(300))
            .with(CpcField::DesiredPerf, CpcEntry::Register(RegisterDescriptor::platform_comm(4, 32, 1)))
            .with(CpcField::Enable, CpcEntry::Register(RegisterDescriptor::NULL));
        let regs: Vec<_> = cpc.registers().map(|(field, _)| field).collect();
        assert_eq!(regs, vec![CpcField::DesiredPerf]);
    }

    proptest! {
        #[test]
        fn only_full_revision_2_tables_are_accepted(
            len in 0usize..24,
            num_entries in 19u64..24,
            revision in 1u64..4,
        ) {
            let entries = vec![CpcEntry::Integer(1); len];
            let accepted = CpcDescriptor::from_table(0, num_entries, revision, &entries).is_ok();
            prop_assert_eq!(accepted, len == FIELD_COUNT && num_entries == 21 && revision == 2);
        }
    }
}
