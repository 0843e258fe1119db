//! Mutation settings.
//!
//! Options are accumulated on a [`SettingsBuilder`] and frozen into an immutable
//! [`MutatorSettings`] by [`SettingsBuilder::finalize`]. The frozen value is moved
//! into the initialization request, so nothing written afterwards can reach the
//! snapshot that was sent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Virtual machine flavour applied to protected code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VmType {
    #[default]
    None,
    Light,
    Heavy,
}

/// Names of the configurable options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptionKey {
    Shuffle,
    BlockAsObject,
    BlockShuffle,
    ObfuscateRtti,
    Partition,
    SectionRandomization,
    MinMutationLength,
    MaxMutationLength,
    Vm,
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptionKey::Shuffle => "shuffle",
            OptionKey::BlockAsObject => "block_as_object",
            OptionKey::BlockShuffle => "block_shuffle",
            OptionKey::ObfuscateRtti => "obfuscate_rtti",
            OptionKey::Partition => "partition",
            OptionKey::SectionRandomization => "section_randomization",
            OptionKey::MinMutationLength => "min_mutation_length",
            OptionKey::MaxMutationLength => "max_mutation_length",
            OptionKey::Vm => "vm_type",
        };
        f.write_str(name)
    }
}

/// A single option write: the key and its correctly typed value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutatorOption {
    Shuffle(bool),
    BlockAsObject(bool),
    BlockShuffle(bool),
    ObfuscateRtti(bool),
    Partition(bool),
    SectionRandomization(bool),
    MinMutationLength(u32),
    MaxMutationLength(u32),
    Vm(VmType),
}

impl MutatorOption {
    pub fn key(&self) -> OptionKey {
        match self {
            MutatorOption::Shuffle(_) => OptionKey::Shuffle,
            MutatorOption::BlockAsObject(_) => OptionKey::BlockAsObject,
            MutatorOption::BlockShuffle(_) => OptionKey::BlockShuffle,
            MutatorOption::ObfuscateRtti(_) => OptionKey::ObfuscateRtti,
            MutatorOption::Partition(_) => OptionKey::Partition,
            MutatorOption::SectionRandomization(_) => OptionKey::SectionRandomization,
            MutatorOption::MinMutationLength(_) => OptionKey::MinMutationLength,
            MutatorOption::MaxMutationLength(_) => OptionKey::MaxMutationLength,
            MutatorOption::Vm(_) => OptionKey::Vm,
        }
    }
}

/// Immutable settings snapshot carried by the initialization request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MutatorSettings {
    shuffle: bool,
    block_as_object: bool,
    block_shuffle: bool,
    obfuscate_rtti: bool,
    partition: bool,
    section_randomization: bool,
    min_mutation_length: u32,
    max_mutation_length: u32,
    vm_type: VmType,
}

impl MutatorSettings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::new()
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn block_as_object(&self) -> bool {
        self.block_as_object
    }

    pub fn block_shuffle(&self) -> bool {
        self.block_shuffle
    }

    pub fn obfuscate_rtti(&self) -> bool {
        self.obfuscate_rtti
    }

    pub fn partition(&self) -> bool {
        self.partition
    }

    pub fn section_randomization(&self) -> bool {
        self.section_randomization
    }

    pub fn min_mutation_length(&self) -> u32 {
        self.min_mutation_length
    }

    pub fn max_mutation_length(&self) -> u32 {
        self.max_mutation_length
    }

    pub fn vm_type(&self) -> VmType {
        self.vm_type
    }
}

/// Mutable accumulator for [`MutatorSettings`]. Last write per key wins.
#[derive(Debug, Clone, Default)]
pub struct SettingsBuilder {
    settings: MutatorSettings,
    written: Vec<OptionKey>,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one option, overwriting any earlier value for the same key
    pub fn set_option(&mut self, option: MutatorOption) -> &mut Self {
        let s = &mut self.settings;
        match option {
            MutatorOption::Shuffle(v) => s.shuffle = v,
            MutatorOption::BlockAsObject(v) => s.block_as_object = v,
            MutatorOption::BlockShuffle(v) => s.block_shuffle = v,
            MutatorOption::ObfuscateRtti(v) => s.obfuscate_rtti = v,
            MutatorOption::Partition(v) => s.partition = v,
            MutatorOption::SectionRandomization(v) => s.section_randomization = v,
            MutatorOption::MinMutationLength(v) => s.min_mutation_length = v,
            MutatorOption::MaxMutationLength(v) => s.max_mutation_length = v,
            MutatorOption::Vm(v) => s.vm_type = v,
        }

        let key = option.key();
        if !self.written.contains(&key) {
            self.written.push(key);
        }
        tracing::trace!(option = %key, "option set");
        self
    }

    /// Chaining form of [`set_option`](Self::set_option)
    pub fn with(mut self, option: MutatorOption) -> Self {
        self.set_option(option);
        self
    }

    /// Keys written so far, in first-write order
    pub fn written(&self) -> &[OptionKey] {
        &self.written
    }

    /// Report inconsistent combinations; empty means fine
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let s = &self.settings;
        if self.written.contains(&OptionKey::MinMutationLength)
            && self.written.contains(&OptionKey::MaxMutationLength)
            && s.min_mutation_length > s.max_mutation_length
        {
            errors.push(format!(
                "min_mutation_length ({}) exceeds max_mutation_length ({})",
                s.min_mutation_length, s.max_mutation_length
            ));
        }
        errors
    }

    /// Freeze the accumulated options. The builder is consumed.
    pub fn finalize(self) -> MutatorSettings {
        for problem in self.validate() {
            tracing::warn!(%problem, "settings look inconsistent");
        }
        self.settings
    }
}
