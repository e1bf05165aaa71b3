use ahash::AHashMap;

use crate::error::{Error, Expected};
use crate::opaque::{self, Opaque};
use crate::runtime::function::Callback;
use crate::runtime::value::{ObjectId, Value};
use crate::vm::{StackIndex, Vm};

/// Something a snapshot refers to by name instead of by value.
#[derive(Debug, Clone)]
pub enum Identity {
    /// A guest object created by a feature, such as a metatable.
    Object(ObjectId),
    /// A host callback. Guest functions invoking it are written as the
    /// callback's name plus their upvalues.
    Callback(Callback),
}

impl Identity {
    fn key(&self) -> IdentityKey {
        match self {
            Identity::Object(id) => IdentityKey::Object(*id),
            Identity::Callback(callback) => IdentityKey::Callback(callback.identity()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum IdentityKey {
    Object(ObjectId),
    Callback(usize),
}

/// The permanent identities contributed by every feature, in contribution
/// order.
///
/// A table is built fresh for every snapshot and every restore. Names and
/// identities must both be unique within one table.
#[derive(Debug, Default)]
pub struct Permanents {
    entries: Vec<(String, Identity)>,
    by_identity: AHashMap<IdentityKey, usize>,
    by_name: AHashMap<String, usize>,
}

impl Permanents {
    /// Returns an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `identity` under `name`.
    pub fn add(&mut self, name: impl Into<String>, identity: Identity) -> Expected<()> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(Error::persistence(format_args!(
                "permanent name `{name}` is registered twice"
            )));
        }
        let key = identity.key();
        if let Some(&existing) = self.by_identity.get(&key) {
            return Err(Error::persistence(format_args!(
                "`{name}` is already registered as `{}`",
                self.entries[existing].0
            )));
        }
        let index = self.entries.len();
        self.entries.try_reserve(1)?;
        self.by_identity.insert(key, index);
        self.by_name.insert(name.clone(), index);
        self.entries.push((name, identity));
        Ok(())
    }

    /// Adds a host callback under `name`.
    pub fn add_callback(&mut self, name: impl Into<String>, callback: &Callback) -> Expected<()> {
        self.add(name, Identity::Callback(callback.clone()))
    }

    /// Adds the guest object at `index` under `name`.
    pub fn add_object(
        &mut self,
        name: impl Into<String>,
        vm: &Vm,
        index: StackIndex,
    ) -> Expected<()> {
        let value = vm.value(index);
        match value.object() {
            Some(id) => self.add(name, Identity::Object(id)),
            None => Err(Error::persistence(format_args!(
                "a {} value cannot be a permanent",
                value.kind()
            ))),
        }
    }

    /// Adds the opaque type `T`: its metatable under its identity, and each
    /// of its methods and declared permanents under `"<identity>.<name>"`.
    pub fn add_opaque<T: Opaque>(&mut self, vm: &Vm) -> Expected<()> {
        let entry = opaque::entry::<T>(vm)?;
        let identity = entry.descriptor.identity();
        self.add(identity, Identity::Object(entry.metatable))?;
        for (name, callback) in entry
            .descriptor
            .methods()
            .iter()
            .chain(entry.descriptor.permanents())
        {
            self.add_callback(format!("{identity}.{name}"), callback)?;
        }
        Ok(())
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the names in contribution order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Returns the identity to name direction, used when writing snapshots.
    #[must_use]
    pub fn forward(&self) -> Forward<'_> {
        Forward(self)
    }

    /// Returns the name to identity direction, used when reading snapshots.
    #[must_use]
    pub fn reverse(&self) -> Reverse<'_> {
        Reverse(self)
    }
}

/// Looks up names by identity.
#[derive(Debug, Clone, Copy)]
pub struct Forward<'a>(&'a Permanents);

impl<'a> Forward<'a> {
    /// Returns the name of the guest object `id`.
    #[must_use]
    pub fn object(&self, id: ObjectId) -> Option<&'a str> {
        self.lookup(IdentityKey::Object(id))
    }

    /// Returns the name of `callback`.
    #[must_use]
    pub fn callback(&self, callback: &Callback) -> Option<&'a str> {
        self.lookup(IdentityKey::Callback(callback.identity()))
    }

    fn lookup(&self, key: IdentityKey) -> Option<&'a str> {
        let index = *self.0.by_identity.get(&key)?;
        Some(self.0.entries[index].0.as_str())
    }
}

/// Looks up identities by name.
#[derive(Debug, Clone, Copy)]
pub struct Reverse<'a>(&'a Permanents);

impl<'a> Reverse<'a> {
    /// Returns the identity registered as `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&'a Identity> {
        let index = *self.0.by_name.get(name)?;
        Some(&self.0.entries[index].1)
    }

    /// Returns the guest value of the object registered as `name`.
    pub fn object(&self, vm: &Vm, name: &str) -> Expected<Value> {
        match self.get(name) {
            Some(Identity::Object(id)) => vm.heap.value_of(*id).ok_or(Error::ObjectCollected),
            Some(Identity::Callback(_)) => Err(Error::persistence(format_args!(
                "permanent `{name}` is a callback, not an object"
            ))),
            None => Err(unknown(name)),
        }
    }

    /// Returns the callback registered as `name`.
    pub fn callback(&self, name: &str) -> Expected<Callback> {
        match self.get(name) {
            Some(Identity::Callback(callback)) => Ok(callback.clone()),
            Some(Identity::Object(_)) => Err(Error::persistence(format_args!(
                "permanent `{name}` is an object, not a callback"
            ))),
            None => Err(unknown(name)),
        }
    }
}

fn unknown(name: &str) -> Error {
    Error::persistence(format_args!("unknown permanent `{name}`"))
}
