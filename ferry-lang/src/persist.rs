//! Snapshots of a guest machine's state.
//!
//! A [`Persistence`] is an ordered list of [`Feature`]s. The order in which
//! features are added is part of the snapshot contract: permanent identities
//! are contributed in that order both when a snapshot is written and when it
//! is restored, so restoring must use features declared in the same order,
//! contributing the same names.
//!
//! A machine moves through two states. It is fresh until
//! [`Persistence::initialize`] runs every feature's [`Feature::on_init`], and
//! ready afterwards. Snapshots and restores require a ready machine.
//!
//! # Restoring
//!
//! Restores are all or nothing. The snapshot is decoded completely before
//! anything visible changes, so a malformed snapshot leaves the machine as it
//! was. If a feature then fails to restore its captured state, the previous
//! globals are reinstalled and every feature is handed back the state it
//! captured just before the restore began, in reverse order. Only a failure
//! during that rollback leaves the machine undefined, and the returned error
//! says so.

use std::io;

use crate::convert::{reserve, StackEstimate};
use crate::error::{Error, Expected};
use crate::runtime::value::{Type, Value};
use crate::vm::{RegistryKey, StackIndex, Vm};

pub mod codec;
mod permanents;

pub use permanents::{Forward, Identity, Permanents, Reverse};

const READY: RegistryKey = RegistryKey::Named("ferry.persistence.ready");

/// A host library that installs itself into a guest machine and takes part
/// in snapshots.
///
/// Every hook must leave the guest stack as it found it.
pub trait Feature {
    /// Returns a unique name for this feature. Captured state is stored
    /// under this name.
    fn name(&self) -> &'static str;

    /// Installs this feature's functions and types into `vm`.
    fn on_init(&self, vm: &mut Vm) -> Expected<()>;

    /// Contributes the permanent identities of everything this feature
    /// installed. Must contribute the same names every time it is called.
    fn on_register_permanents(&self, vm: &mut Vm, permanents: &mut Permanents) -> Expected<()>;

    /// Returns true if this feature keeps state outside of the globals that
    /// must be captured in snapshots.
    fn captures_state(&self) -> bool {
        false
    }

    /// Returns this feature's state as a guest value.
    fn on_capture(&self, vm: &mut Vm) -> Expected<Value> {
        let _ = vm;
        Ok(Value::Nil)
    }

    /// Replaces this feature's state with `captured`, which was returned by
    /// [`Feature::on_capture`]. Features that capture nothing receive `nil`.
    fn on_restore(&self, vm: &mut Vm, captured: Value) -> Expected<()> {
        let _ = (vm, captured);
        Ok(())
    }
}

/// Builds a [`Persistence`].
#[must_use]
#[derive(Default)]
pub struct PersistenceBuilder {
    features: Vec<Box<dyn Feature>>,
}

impl PersistenceBuilder {
    /// Appends `feature`.
    pub fn with_feature(mut self, feature: impl Feature + 'static) -> Self {
        self.features.push(Box::new(feature));
        self
    }

    /// Appends every feature of `other`, after the features already added.
    pub fn with_features(mut self, other: PersistenceBuilder) -> Self {
        self.features.extend(other.features);
        self
    }

    /// Returns the persistence engine.
    #[must_use]
    pub fn build(self) -> Persistence {
        Persistence {
            features: self.features,
        }
    }
}

/// Initializes, snapshots, and restores guest machines using an ordered list
/// of features.
pub struct Persistence {
    features: Vec<Box<dyn Feature>>,
}

impl Persistence {
    /// Returns a builder with no features.
    pub fn builder() -> PersistenceBuilder {
        PersistenceBuilder::default()
    }

    /// Returns the features in declaration order.
    pub fn features(&self) -> impl Iterator<Item = &dyn Feature> + '_ {
        self.features.iter().map(|feature| &**feature)
    }

    /// Returns true if `vm` has been initialized.
    #[must_use]
    pub fn is_initialized(vm: &Vm) -> bool {
        matches!(vm.registry_value(READY), Some(Value::Bool(true)))
    }

    fn check_ready(vm: &Vm) -> Expected<()> {
        assert!(
            !vm.in_call(),
            "persistence cannot be used from inside a guest call"
        );
        if Self::is_initialized(vm) {
            Ok(())
        } else {
            Err(Error::Uninitialized)
        }
    }

    /// Installs every feature into `vm`, in declaration order.
    pub fn initialize(&self, vm: &mut Vm) -> Expected<()> {
        assert!(
            !vm.in_call(),
            "persistence cannot be used from inside a guest call"
        );
        if Self::is_initialized(vm) {
            return Err(Error::persistence("the virtual machine is already initialized"));
        }
        for (index, feature) in self.features.iter().enumerate() {
            if self.features[..index]
                .iter()
                .any(|earlier| earlier.name() == feature.name())
            {
                return Err(Error::persistence(format_args!(
                    "feature `{}` is declared twice",
                    feature.name()
                )));
            }
        }
        for feature in &self.features {
            debug!(feature = feature.name(), "initializing feature");
            vm.balanced(|vm| feature.on_init(vm)).map_err(|err| {
                err.prepend_context(format_args!("while initializing `{}`", feature.name()))
            })?;
        }
        reserve(vm, StackEstimate::Slots(1))?;
        vm.push_bool(true);
        vm.set_registry(READY);
        info!(features = self.features.len(), "persistence initialized");
        Ok(())
    }

    /// Builds the permanent identity table by asking every feature, in
    /// declaration order.
    pub fn permanents(&self, vm: &mut Vm) -> Expected<Permanents> {
        let mut permanents = Permanents::new();
        for feature in &self.features {
            vm.balanced(|vm| feature.on_register_permanents(vm, &mut permanents))
                .map_err(|err| {
                    err.prepend_context(format_args!(
                        "while registering permanents of `{}`",
                        feature.name()
                    ))
                })?;
        }
        Ok(permanents)
    }

    /// Returns a snapshot of `vm`.
    pub fn snapshot(&self, vm: &mut Vm) -> Expected<Vec<u8>> {
        let mut bytes = Vec::new();
        self.snapshot_to(vm, &mut bytes)?;
        info!(bytes = bytes.len(), "snapshot written");
        Ok(bytes)
    }

    /// Writes a snapshot of `vm` to `writer`.
    ///
    /// The snapshot holds the globals and the captured state of every
    /// feature. Fails if anything reachable from them cannot be written.
    pub fn snapshot_to(&self, vm: &mut Vm, writer: impl io::Write) -> Expected<()> {
        Self::check_ready(vm)?;
        let permanents = self.permanents(vm)?;
        vm.balanced(|vm| {
            let top = vm.top();
            let result = self
                .push_target(vm)
                .and_then(|()| codec::dump(vm, permanents.forward(), &vm.value(-1), writer));
            vm.set_top(top);
            result
        })
    }

    /// Pushes `{globals = ..., captured = {[feature] = state}}`.
    fn push_target(&self, vm: &mut Vm) -> Expected<()> {
        reserve(vm, StackEstimate::Slots(3))?;
        vm.new_table();
        vm.push_globals();
        vm.set_field(-2, "globals")?;
        vm.new_table();
        for feature in self.features.iter().filter(|feature| feature.captures_state()) {
            let captured = vm.balanced(|vm| feature.on_capture(vm)).map_err(|err| {
                err.prepend_context(format_args!("while capturing `{}`", feature.name()))
            })?;
            vm.push_value(captured);
            vm.set_field(-2, feature.name())?;
        }
        vm.set_field(-2, "captured")
    }

    /// Replaces the state of `vm` with `snapshot`.
    pub fn restore(&self, vm: &mut Vm, snapshot: &[u8]) -> Expected<()> {
        self.restore_from(vm, snapshot)
    }

    /// Replaces the state of `vm` with a snapshot read from `reader`.
    pub fn restore_from(&self, vm: &mut Vm, reader: impl io::Read) -> Expected<()> {
        Self::check_ready(vm)?;
        let permanents = self.permanents(vm)?;
        vm.balanced(|vm| {
            let top = vm.top();
            let result = self.restore_inner(vm, &permanents, reader);
            vm.set_top(top);
            result
        })
    }

    fn restore_inner(
        &self,
        vm: &mut Vm,
        permanents: &Permanents,
        reader: impl io::Read,
    ) -> Expected<()> {
        reserve(vm, StackEstimate::Slots(6))?;
        let target = codec::undump(vm, permanents.reverse(), reader)?;
        vm.push_value(target);
        if vm.get_type(-1) != Type::Table {
            return Err(Error::persistence("snapshot root is not a table"));
        }
        let target = vm.absolute(-1);
        if vm.get_field(target, "globals")? != Type::Table {
            return Err(Error::persistence("snapshot has no globals table"));
        }
        let globals = vm.absolute(-1);
        let captured = match vm.get_field(target, "captured")? {
            Type::Table | Type::Nil => vm.absolute(-1),
            other => {
                return Err(Error::persistence(format_args!(
                    "snapshot captured state is a {other}"
                )))
            }
        };

        // Everything is decoded. Remember what to roll back to.
        vm.push_globals();
        let previous_globals = vm.absolute(-1);
        vm.new_table();
        let previous = vm.absolute(-1);
        for feature in self.features.iter().filter(|feature| feature.captures_state()) {
            let state = vm.balanced(|vm| feature.on_capture(vm))?;
            vm.push_value(state);
            vm.set_field(previous, feature.name())?;
        }

        vm.push_copy(globals);
        vm.replace_globals()?;
        for (index, feature) in self.features.iter().enumerate() {
            let state = captured_state(vm, captured, feature.name())?;
            let restored = vm
                .balanced(|vm| feature.on_restore(vm, state))
                .map_err(|err| {
                    err.prepend_context(format_args!("while restoring `{}`", feature.name()))
                });
            if let Err(err) = restored {
                warn!(
                    feature = feature.name(),
                    "restore failed, rolling back: {err}"
                );
                return Err(self.roll_back(vm, index, previous_globals, previous, err));
            }
        }
        info!(features = self.features.len(), "snapshot restored");
        Ok(())
    }

    fn roll_back(
        &self,
        vm: &mut Vm,
        failed: usize,
        previous_globals: StackIndex,
        previous: StackIndex,
        err: Error,
    ) -> Error {
        vm.push_copy(previous_globals);
        let mut result = vm.replace_globals();
        for feature in self.features[..=failed].iter().rev() {
            let state = match captured_state(vm, previous, feature.name()) {
                Ok(state) => state,
                Err(err) => {
                    result = result.and(Err(err));
                    continue;
                }
            };
            result = result.and(vm.balanced(|vm| feature.on_restore(vm, state)));
        }
        match result {
            Ok(()) => err.prepend_context("restore was rolled back"),
            Err(rollback) => err.prepend_context(format_args!(
                "rolling back the failed restore also failed, leaving the virtual machine in an \
                 undefined state: {rollback}"
            )),
        }
    }
}

/// Returns the state stored under `name` in the table at `index`, or `nil`
/// if `index` does not hold a table.
fn captured_state(vm: &mut Vm, index: StackIndex, name: &str) -> Expected<Value> {
    if vm.get_type(index) != Type::Table {
        return Ok(Value::Nil);
    }
    vm.get_field(index, name)?;
    Ok(vm.pop_value())
}
