//! [`ModuleRegistry`] – the set of loaded modules.
//!
//! Modules live in a generational arena. A [`ModuleId`] carries the slot
//! index plus the generation the slot had when the module was inserted, so an
//! id kept around after its module was unloaded never resolves to whatever
//! module reuses the slot later.

use devstate_types::{DevStateError, Message, MessageKind};

use crate::bus::{BusError, Context};
use crate::endpoint::Endpoint;

// ────────────────────────────────────────────────────────────────────────────
// Module interface
// ────────────────────────────────────────────────────────────────────────────

/// One `(type, size)` pair a module wants delivered to [`Module::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub kind: MessageKind,
    pub size: u32,
}

impl Binding {
    /// Bind `kind` at its canonical wire size.
    pub fn of(kind: MessageKind) -> Self {
        Self {
            kind,
            size: kind.fixed_size(),
        }
    }
}

/// A statically linked unit of policy plugged into the bus.
///
/// The bus calls [`init`](Module::init) once after registering every
/// [`Binding`] returned by [`message_handlers`](Module::message_handlers),
/// then routes matching messages to [`handle`](Module::handle) until the
/// module is unloaded, at which point [`fini`](Module::fini) runs.
pub trait Module {
    /// Short identifier used in logs and in the daemon's module list.
    fn name(&self) -> &str;

    fn message_handlers(&self) -> Vec<Binding>;

    fn init(&mut self, _ctx: &mut Context<'_>) -> Result<(), DevStateError> {
        Ok(())
    }

    fn fini(&mut self, _ctx: &mut Context<'_>) {}

    fn handle(&mut self, ctx: &mut Context<'_>, from: &Endpoint, msg: &Message);
}

// ────────────────────────────────────────────────────────────────────────────
// Arena
// ────────────────────────────────────────────────────────────────────────────

/// Generational handle to a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct LoadedModule {
    module: Box<dyn Module>,
    priority: i32,
}

struct Slot {
    generation: u32,
    entry: Option<LoadedModule>,
}

#[derive(Default)]
pub struct ModuleRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `module` and return its id. Reuses a free slot when one exists.
    ///
    /// # Errors
    ///
    /// [`BusError::OutOfMemory`] when the arena cannot grow.
    pub fn insert(&mut self, module: Box<dyn Module>, priority: i32) -> Result<ModuleId, BusError> {
        let entry = LoadedModule { module, priority };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return Ok(ModuleId {
                index,
                generation: slot.generation,
            });
        }
        self.slots
            .try_reserve(1)
            .map_err(|e| BusError::OutOfMemory(format!("module registry: {e}")))?;
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        Ok(ModuleId {
            index,
            generation: 0,
        })
    }

    /// Remove the module behind `id`, bumping the slot generation.
    pub fn remove(&mut self, id: ModuleId) -> Option<Box<dyn Module>> {
        let slot = self.live_slot_mut(id)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(entry.module)
    }

    pub fn contains(&self, id: ModuleId) -> bool {
        self.live_slot(id).is_some()
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut (dyn Module + 'static)> {
        self.live_slot_mut(id)?
            .entry
            .as_mut()
            .map(|e| e.module.as_mut())
    }

    pub fn priority(&self, id: ModuleId) -> Option<i32> {
        self.live_slot(id)?.entry.as_ref().map(|e| e.priority)
    }

    pub fn name(&self, id: ModuleId) -> Option<&str> {
        self.live_slot(id)?.entry.as_ref().map(|e| e.module.name())
    }

    /// Ids of every loaded module in slot order.
    pub fn ids(&self) -> Vec<ModuleId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| ModuleId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_slot(&self, id: ModuleId) -> Option<&Slot> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation && s.entry.is_some())
    }

    fn live_slot_mut(&mut self, id: ModuleId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation && s.entry.is_some())
    }
}
