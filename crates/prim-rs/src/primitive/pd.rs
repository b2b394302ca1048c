//! Resolved primitive descriptors and the working state candidates initialize.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::args::{classify_args, ArgSlot};
use super::scratchpad::{ScratchpadKey, ScratchpadRegistry};
use crate::desc::{Arg, ArgUsage, MemoryDesc, OpDesc, OpKind, PrimitiveAttr};
use crate::engine::Engine;
use crate::error::PrimResult;

/// Private working copy a candidate inspects and finalizes during resolution.
///
/// Each candidate receives a fresh copy, so a declined attempt cannot leak format choices or
/// scratchpad bookings into the next candidate.
pub struct PdInit<'a> {
    desc: OpDesc,
    attr: &'a Arc<PrimitiveAttr>,
    hint: Option<&'a Arc<PrimitiveDesc>>,
    engine: &'a dyn Engine,
    workspace: MemoryDesc,
    scratchpad: ScratchpadRegistry,
}

impl<'a> PdInit<'a> {
    pub(crate) fn new(
        desc: &OpDesc,
        attr: &'a Arc<PrimitiveAttr>,
        hint: Option<&'a Arc<PrimitiveDesc>>,
        engine: &'a dyn Engine,
    ) -> Self {
        Self {
            desc: desc.clone(),
            attr,
            hint,
            engine,
            workspace: MemoryDesc::zero(),
            scratchpad: ScratchpadRegistry::new(),
        }
    }

    pub fn desc(&self) -> &OpDesc {
        &self.desc
    }

    /// Mutable descriptor, used to replace `any` formats with concrete layouts.
    pub fn desc_mut(&mut self) -> &mut OpDesc {
        &mut self.desc
    }

    pub fn attr(&self) -> &PrimitiveAttr {
        self.attr
    }

    /// Forward descriptor supplied for a backward resolution.
    pub fn hint(&self) -> Option<&PrimitiveDesc> {
        self.hint.map(|hint| hint.as_ref())
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine
    }

    pub fn set_workspace(&mut self, desc: MemoryDesc) {
        self.workspace = desc;
    }

    pub fn book_scratchpad(&mut self, key: ScratchpadKey, bytes: usize) -> PrimResult<()> {
        self.scratchpad.book(key, bytes)
    }

    pub(crate) fn finish(
        self,
        impl_name: &'static str,
        original: Arc<OpDesc>,
    ) -> PrimitiveDesc {
        let slots = classify_args(
            &self.desc,
            self.attr,
            &self.workspace,
            self.scratchpad.size(),
        );
        PrimitiveDesc {
            impl_name,
            desc: self.desc,
            original,
            attr: Arc::new(PrimitiveAttr::clone(self.attr)),
            slots,
            workspace: self.workspace,
            scratchpad: self.scratchpad,
            hint: self.hint.cloned(),
        }
    }
}

/// Immutable result of resolving a descriptor against one candidate.
pub struct PrimitiveDesc {
    impl_name: &'static str,
    desc: OpDesc,
    original: Arc<OpDesc>,
    attr: Arc<PrimitiveAttr>,
    slots: BTreeMap<Arg, ArgSlot>,
    workspace: MemoryDesc,
    scratchpad: ScratchpadRegistry,
    hint: Option<Arc<PrimitiveDesc>>,
}

impl PrimitiveDesc {
    /// Descriptor of a primitive with nothing to compute. Operand descriptors stay queryable but
    /// no argument is required at execution.
    pub(crate) fn zero_dim(
        impl_name: &'static str,
        original: Arc<OpDesc>,
        attr: Arc<PrimitiveAttr>,
    ) -> Self {
        let desc = (*original).clone();
        let mut slots = classify_args(&desc, &attr, &MemoryDesc::zero(), 0);
        for slot in slots.values_mut() {
            slot.usage = ArgUsage::Unused;
        }
        Self {
            impl_name,
            desc,
            original,
            attr,
            slots,
            workspace: MemoryDesc::zero(),
            scratchpad: ScratchpadRegistry::new(),
            hint: None,
        }
    }

    pub fn impl_name(&self) -> &'static str {
        self.impl_name
    }

    pub fn kind(&self) -> OpKind {
        self.desc.kind()
    }

    /// Descriptor with every `any` format resolved.
    pub fn op_desc(&self) -> &OpDesc {
        &self.desc
    }

    /// Descriptor as the caller supplied it, owned by this primitive descriptor.
    pub fn original_desc(&self) -> &Arc<OpDesc> {
        &self.original
    }

    pub fn attr(&self) -> &Arc<PrimitiveAttr> {
        &self.attr
    }

    pub fn hint(&self) -> Option<&Arc<PrimitiveDesc>> {
        self.hint.as_ref()
    }

    /// Memory descriptor bound to `arg`, or [`MemoryDesc::zero`] when the slot is not used.
    pub fn arg_md(&self, arg: Arg) -> MemoryDesc {
        self.slots
            .get(&arg)
            .map(|slot| slot.desc.clone())
            .unwrap_or_default()
    }

    pub fn arg_usage(&self, arg: Arg) -> ArgUsage {
        self.slots
            .get(&arg)
            .map_or(ArgUsage::Unused, |slot| slot.usage)
    }

    /// Slots that must be present in the argument map at execution.
    pub fn required_args(&self) -> impl Iterator<Item = (Arg, &ArgSlot)> + '_ {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.usage != ArgUsage::Unused)
            .map(|(arg, slot)| (*arg, slot))
    }

    pub fn n_inputs(&self) -> usize {
        self.count_usage(ArgUsage::Input)
    }

    pub fn n_outputs(&self) -> usize {
        self.count_usage(ArgUsage::Output)
    }

    fn count_usage(&self, usage: ArgUsage) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.usage == usage)
            .count()
    }

    pub fn workspace_md(&self) -> &MemoryDesc {
        &self.workspace
    }

    pub fn scratchpad_size(&self) -> usize {
        self.scratchpad.size()
    }

    pub fn scratchpad_registry(&self) -> &ScratchpadRegistry {
        &self.scratchpad
    }
}

impl fmt::Debug for PrimitiveDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimitiveDesc")
            .field("impl_name", &self.impl_name)
            .field("kind", &self.kind())
            .field("args", &self.slots.len())
            .field("scratchpad", &self.scratchpad.size())
            .finish()
    }
}

impl fmt::Display for PrimitiveDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.kind(), self.impl_name)?;
        for (arg, slot) in &self.slots {
            write!(f, ",{arg:?}:{}", slot.desc)?;
        }
        Ok(())
    }
}
