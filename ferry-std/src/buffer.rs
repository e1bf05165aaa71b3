use ferry_lang::adapter::Outcome;
use ferry_lang::convert::Variadic;
use ferry_lang::error::Expected;
use ferry_lang::opaque;
use ferry_lang::{Callback, Feature, Handle, Opaque, OpaqueType, Permanents, Value, Vm};
use serde::{Deserialize, Serialize};

use crate::library::Library;

/// A growable list of strings, usable from guest code as an opaque object.
///
/// Guest code creates buffers with `buffer.new(...)` and calls the methods
/// `push`, `len`, `join` and `clear` on them. Buffers are persistable.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    parts: Vec<String>,
}

impl Buffer {
    /// Returns the strings pushed so far.
    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.parts
    }
}

fn display_all(vm: &Vm, values: &[Value]) -> Vec<String> {
    values.iter().map(|value| vm.display(value)).collect()
}

static BUFFER: OpaqueType<Buffer> = OpaqueType::new("Buffer", |t| {
    t.with_method(
        "push",
        |vm: &mut Vm, this: Handle<Buffer>, values: Variadic<Value>| -> Expected<usize> {
            let parts = display_all(vm, &values);
            let buffer = this.get_mut(vm)?;
            buffer.parts.try_reserve(parts.len())?;
            buffer.parts.extend(parts);
            Ok(buffer.parts.len())
        },
    )
    .with_method("len", |vm: &mut Vm, this: Handle<Buffer>| -> Expected<usize> {
        Ok(this.get(vm)?.parts.len())
    })
    .with_method(
        "join",
        |vm: &mut Vm, this: Handle<Buffer>, separator: Option<String>| -> Expected<String> {
            Ok(this.get(vm)?.parts.join(separator.as_deref().unwrap_or("")))
        },
    )
    .with_method("clear", |vm: &mut Vm, this: Handle<Buffer>| -> Expected<()> {
        this.get_mut(vm)?.parts.clear();
        Ok(())
    })
    .with_persistence()
});

impl Opaque for Buffer {
    fn opaque_type() -> &'static OpaqueType<Self> {
        &BUFFER
    }
}

/// Installs the `Buffer` type and the `buffer` library.
pub struct Buffers {
    library: Library,
}

impl Buffers {
    /// Returns the buffer library.
    #[must_use]
    pub fn new() -> Self {
        let new = Callback::new(
            |vm: &mut Vm, values: Variadic<Value>| -> Expected<Outcome> {
                let parts = display_all(vm, &values);
                opaque::push(vm, Buffer { parts })?;
                Ok(Outcome::Return(1))
            },
        );
        Self {
            library: Library::new("buffer", "ferry.std.buffer").with("new", new),
        }
    }
}

impl Default for Buffers {
    fn default() -> Self {
        Self::new()
    }
}

impl Feature for Buffers {
    fn name(&self) -> &'static str {
        "buffers"
    }

    fn on_init(&self, vm: &mut Vm) -> Expected<()> {
        opaque::register::<Buffer>(vm)?;
        self.library.install(vm)
    }

    fn on_register_permanents(&self, vm: &mut Vm, permanents: &mut Permanents) -> Expected<()> {
        permanents.add_opaque::<Buffer>(vm)?;
        self.library.register_permanents(vm, permanents)
    }
}
