use ferry_lang::convert::{reserve, StackEstimate};
use ferry_lang::error::{Error, Expected};
use ferry_lang::vm::RegistryKey;
use ferry_lang::{Callback, Permanents, Type, Vm};

/// A global table of host functions.
///
/// The table is also kept in the registry so that it can be contributed as a
/// permanent even after guest code reassigns the global.
pub(crate) struct Library {
    name: &'static str,
    key: RegistryKey,
    functions: Vec<(&'static str, Callback)>,
}

impl Library {
    pub fn new(name: &'static str, key: &'static str) -> Self {
        Self {
            name,
            key: RegistryKey::Named(key),
            functions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, name: &'static str, callback: Callback) -> Self {
        self.functions.push((name, callback));
        self
    }

    pub fn install(&self, vm: &mut Vm) -> Expected<()> {
        reserve(vm, StackEstimate::Slots(3))?;
        let top = vm.top();
        vm.new_table();
        for (name, callback) in &self.functions {
            vm.push_function(callback.clone());
            if let Err(err) = vm.set_field(-2, name) {
                vm.set_top(top);
                return Err(err);
            }
        }
        vm.push_copy(-1);
        vm.set_registry(self.key);
        vm.set_global(self.name);
        debug!(
            library = self.name,
            functions = self.functions.len(),
            "installed library"
        );
        Ok(())
    }

    /// Contributes the table as `<name>` and each function as
    /// `<name>.<function>`.
    pub fn register_permanents(&self, vm: &mut Vm, permanents: &mut Permanents) -> Expected<()> {
        for (name, callback) in &self.functions {
            permanents.add_callback(format!("{}.{name}", self.name), callback)?;
        }
        reserve(vm, StackEstimate::Slots(1))?;
        let result = if vm.push_registry(self.key) == Type::Table {
            permanents.add_object(self.name, vm, -1)
        } else {
            Err(Error::persistence(format_args!(
                "library `{}` is not installed",
                self.name
            )))
        };
        vm.pop(1);
        result
    }
}
