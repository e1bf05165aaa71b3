use std::any::Any;

use alot::{LotId, Lots};

use crate::runtime::coroutine::Coroutine;
use crate::runtime::function::Function;
use crate::runtime::table::{Key, Table};
use crate::runtime::value::{ObjectId, Value};

/// A host value embedded in guest memory.
pub(crate) struct OpaqueBlock {
    /// `None` once the object has been finalized.
    pub data: Option<Box<dyn Any + Send>>,
    /// The metatable identifying the registered type. Invalidated together
    /// with `data`.
    pub meta: Option<ObjectId>,
}

pub(crate) enum Object {
    Table(Table),
    Function(Function),
    Opaque(OpaqueBlock),
    Thread(Coroutine),
}

impl Object {
    fn trace(&self, worklist: &mut Vec<ObjectId>) {
        match self {
            Object::Table(table) => {
                worklist.extend(table.metatable);
                for (key, value) in table.iter() {
                    worklist.extend(key.to_value().object());
                    worklist.extend(value.object());
                }
            }
            Object::Function(function) => {
                worklist.extend(function.upvalues.iter().filter_map(Value::object));
            }
            Object::Opaque(block) => worklist.extend(block.meta),
            Object::Thread(coroutine) => {
                worklist.extend(coroutine.pending.as_ref().and_then(Value::object));
            }
        }
    }
}

struct Slot {
    object: Object,
    marked: bool,
    finalized: bool,
}

/// The result of a collection cycle.
#[derive(Debug, Default)]
pub(crate) struct Sweep {
    pub freed: usize,
    pub retained: usize,
    /// Unreachable opaque objects kept alive for one more cycle so that their
    /// teardown entry can run.
    pub finalize: Vec<(ObjectId, Value)>,
}

/// The guest machine's object arena.
#[derive(Default)]
pub(crate) struct Heap {
    slots: Lots<Slot>,
    live: Vec<LotId>,
    pub allocations: usize,
}

impl Heap {
    pub fn allocate(&mut self, object: Object) -> ObjectId {
        let id = self.slots.push(Slot {
            object,
            marked: false,
            finalized: false,
        });
        self.live.push(id);
        self.allocations += 1;
        ObjectId(id)
    }

    /// Frees `id` immediately, without finalization.
    pub fn release(&mut self, id: ObjectId) {
        if self.slots.remove(id.0).is_some() {
            self.live.retain(|live| *live != id.0);
        }
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.slots.get(id.0).is_some()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.slots.get(id.0).map(|slot| &slot.object)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.slots.get_mut(id.0).map(|slot| &mut slot.object)
    }

    /// Returns a value referring to `id`, typed by the object it holds.
    pub fn value_of(&self, id: ObjectId) -> Option<Value> {
        Some(match self.get(id)? {
            Object::Table(_) => Value::Table(id),
            Object::Function(_) => Value::Function(id),
            Object::Opaque(_) => Value::Opaque(id),
            Object::Thread(_) => Value::Thread(id),
        })
    }

    pub fn table(&self, id: ObjectId) -> Option<&Table> {
        match self.get(id) {
            Some(Object::Table(table)) => Some(table),
            _ => None,
        }
    }

    pub fn table_mut(&mut self, id: ObjectId) -> Option<&mut Table> {
        match self.get_mut(id) {
            Some(Object::Table(table)) => Some(table),
            _ => None,
        }
    }

    pub fn function(&self, id: ObjectId) -> Option<&Function> {
        match self.get(id) {
            Some(Object::Function(function)) => Some(function),
            _ => None,
        }
    }

    pub fn function_mut(&mut self, id: ObjectId) -> Option<&mut Function> {
        match self.get_mut(id) {
            Some(Object::Function(function)) => Some(function),
            _ => None,
        }
    }

    pub fn opaque(&self, id: ObjectId) -> Option<&OpaqueBlock> {
        match self.get(id) {
            Some(Object::Opaque(block)) => Some(block),
            _ => None,
        }
    }

    pub fn opaque_mut(&mut self, id: ObjectId) -> Option<&mut OpaqueBlock> {
        match self.get_mut(id) {
            Some(Object::Opaque(block)) => Some(block),
            _ => None,
        }
    }

    pub fn coroutine(&self, id: ObjectId) -> Option<&Coroutine> {
        match self.get(id) {
            Some(Object::Thread(coroutine)) => Some(coroutine),
            _ => None,
        }
    }

    pub fn coroutine_mut(&mut self, id: ObjectId) -> Option<&mut Coroutine> {
        match self.get_mut(id) {
            Some(Object::Thread(coroutine)) => Some(coroutine),
            _ => None,
        }
    }

    /// Marks everything reachable from `roots` and frees everything else.
    ///
    /// Unreachable opaque objects with a pending teardown entry are retained
    /// and returned in [`Sweep::finalize`]. They are flagged as finalized, so
    /// they are freed by the next cycle that finds them unreachable.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = ObjectId>) -> Sweep {
        let mut worklist = roots.into_iter().collect::<Vec<_>>();
        while let Some(id) = worklist.pop() {
            let Some(slot) = self.slots.get_mut(id.0) else {
                continue;
            };
            if slot.marked {
                continue;
            }
            slot.marked = true;
            slot.object.trace(&mut worklist);
        }

        let mut sweep = Sweep::default();
        let mut live = std::mem::take(&mut self.live);
        live.retain(|&id| {
            let marked = self.slots.get(id).map_or(false, |slot| slot.marked);
            if marked {
                return true;
            }
            if let Some(finalizer) = pending_finalizer(&self.slots, id) {
                sweep.finalize.push((ObjectId(id), finalizer));
                return true;
            }
            self.slots.remove(id);
            sweep.freed += 1;
            false
        });
        for &(ObjectId(id), _) in &sweep.finalize {
            if let Some(slot) = self.slots.get_mut(id) {
                slot.finalized = true;
            }
        }
        for &id in &live {
            if let Some(slot) = self.slots.get_mut(id) {
                slot.marked = false;
            }
        }
        sweep.retained = live.len();
        self.live = live;
        self.allocations = 0;
        sweep
    }

    /// Returns every opaque object that still has a pending teardown entry,
    /// flagging each as finalized.
    pub fn drain_finalizers(&mut self) -> Vec<(ObjectId, Value)> {
        let pending = self
            .live
            .iter()
            .filter_map(|&id| Some((ObjectId(id), pending_finalizer(&self.slots, id)?)))
            .collect::<Vec<_>>();
        for &(ObjectId(id), _) in &pending {
            if let Some(slot) = self.slots.get_mut(id) {
                slot.finalized = true;
            }
        }
        pending
    }
}

/// Returns the teardown function registered in the metatable of the opaque
/// object `id`, if it has one and has not been finalized.
fn pending_finalizer(slots: &Lots<Slot>, id: LotId) -> Option<Value> {
    let slot = slots.get(id)?;
    if slot.finalized {
        return None;
    }
    let Object::Opaque(block) = &slot.object else {
        return None;
    };
    let Object::Table(metatable) = &slots.get(block.meta?.0)?.object else {
        return None;
    };
    match metatable.get(&Key::from("__gc")) {
        Some(function @ Value::Function(_)) => Some(function.clone()),
        _ => None,
    }
}
