use ferry_lang::adapter::Outcome;
use ferry_lang::convert::Variadic;
use ferry_lang::error::{Error, Expected};
use ferry_lang::{Callback, Feature, Permanents, Value, Vm};

use crate::library::Library;
use crate::Output;

const HELP: &[(&str, &str)] = &[
    ("print", "print(...): writes its arguments separated by tabs"),
    ("help", "help([name]): describes the functions of `lib`"),
    ("type", "type(value): returns the type name of `value`"),
    ("tostring", "tostring(value): returns `value` as a string"),
    ("error", "error(message): raises `message` as an error"),
];

/// The base library, installed as the global `lib`.
///
/// `print` and `help` write to an [`Output`]. The library keeps no state of
/// its own.
pub struct Base {
    library: Library,
}

impl Base {
    /// Returns the base library writing to `output`.
    #[must_use]
    pub fn new(output: Output) -> Self {
        let print = Callback::new({
            let output = output.clone();
            move |vm: &mut Vm, values: Variadic<Value>| -> Expected<()> {
                let line = values
                    .iter()
                    .map(|value| vm.display(value))
                    .collect::<Vec<_>>()
                    .join("\t");
                output.write_line(&line)
            }
        });
        let help = Callback::new(move |_vm: &mut Vm, name: Option<String>| -> Expected<()> {
            match name {
                Some(name) => {
                    let (_, text) = HELP
                        .iter()
                        .find(|(function, _)| *function == name)
                        .ok_or_else(|| Error::runtime(format_args!("no help for `{name}`")))?;
                    output.write_line(text)
                }
                None => HELP.iter().try_for_each(|(_, text)| output.write_line(text)),
            }
        });
        let type_of = Callback::new(|vm: &mut Vm, _value: Value| -> Expected<String> {
            Ok(vm.type_name(1))
        });
        let tostring = Callback::new(|vm: &mut Vm, value: Value| -> Expected<String> {
            Ok(vm.display(&value))
        });
        let error = Callback::new(|_vm: &mut Vm, message: String| {
            Outcome::Error(Error::runtime(message))
        });
        Self {
            library: Library::new("lib", "ferry.std.lib")
                .with("print", print)
                .with("help", help)
                .with("type", type_of)
                .with("tostring", tostring)
                .with("error", error),
        }
    }
}

impl Feature for Base {
    fn name(&self) -> &'static str {
        "base"
    }

    fn on_init(&self, vm: &mut Vm) -> Expected<()> {
        self.library.install(vm)
    }

    fn on_register_permanents(&self, vm: &mut Vm, permanents: &mut Permanents) -> Expected<()> {
        self.library.register_permanents(vm, permanents)
    }
}
