//! An interactive shell for calling into a `ferry` machine and saving or
//! restoring its state.

use std::ops::Range;
use std::path::{Path, PathBuf};

use ariadne::{Label, Report, ReportKind, Source};
use ferry::stdlib::{standard, Output};
use ferry::vm::{Results, Status};
use ferry::{Persistence, StackIndex, Type, Value, Vm};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const PROMPT: &str = "ferry> ";

fn main() {
    #[cfg(feature = "tracing")]
    tracing_subscriber::fmt::init();

    let persistence = standard(Output::stdout()).build();
    let mut vm = Vm::new();
    if let Err(err) = persistence.initialize(&mut vm) {
        eprintln!("cannot initialize the virtual machine: {err}");
        std::process::exit(1);
    }

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("cannot open the line editor: {err}");
            std::process::exit(1);
        }
    };
    let history = history_path();
    if let Some(history) = &history {
        let _ = editor.load_history(history);
    }

    println!("ferry {} (type :help for commands)", env!("CARGO_PKG_VERSION"));
    let mut repl = Repl { vm, persistence };
    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(trimmed);
                if let Some(command) = trimmed.strip_prefix(':') {
                    if !repl.command(command) {
                        break;
                    }
                } else {
                    repl.evaluate(&line);
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{err}");
                break;
            }
        }
    }

    if let Some(history) = &history {
        if let Some(parent) = history.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = editor.save_history(history);
    }
}

struct Repl {
    vm: Vm,
    persistence: Persistence,
}

impl Repl {
    /// Runs a `:` command. Returns false when the session should end.
    fn command(&mut self, command: &str) -> bool {
        let (name, argument) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(name, argument)| (name, argument.trim()));
        match name {
            "quit" | "q" => return false,
            "help" => {
                println!("path.to.function arg...   call a function with literal arguments");
                println!(":save <file>              write a snapshot");
                println!(":load <file>              restore a snapshot");
                println!(":globals                  list the globals");
                println!(":gc                       collect garbage");
                println!(":quit                     leave");
            }
            "save" => self.save(Path::new(argument)),
            "load" => self.load(Path::new(argument)),
            "globals" => self.globals(),
            "gc" => {
                let freed = self.vm.collect_garbage();
                println!("freed {freed} objects, {} live", self.vm.object_count());
            }
            _ => eprintln!("unknown command `:{name}`"),
        }
        true
    }

    fn save(&mut self, path: &Path) {
        if path.as_os_str().is_empty() {
            eprintln!("usage: :save <file>");
            return;
        }
        match self.persistence.snapshot(&mut self.vm) {
            Ok(bytes) => match std::fs::write(path, &bytes) {
                Ok(()) => println!("saved {} bytes to {}", bytes.len(), path.display()),
                Err(err) => eprintln!("cannot write {}: {err}", path.display()),
            },
            Err(err) => eprintln!("snapshot failed: {err}"),
        }
    }

    fn load(&mut self, path: &Path) {
        if path.as_os_str().is_empty() {
            eprintln!("usage: :load <file>");
            return;
        }
        match std::fs::read(path) {
            Ok(bytes) => match self.persistence.restore(&mut self.vm, &bytes) {
                Ok(()) => println!("restored {}", path.display()),
                Err(err) => eprintln!("restore failed: {err}"),
            },
            Err(err) => eprintln!("cannot read {}: {err}", path.display()),
        }
    }

    fn globals(&mut self) {
        self.vm.push_globals();
        let pairs = self.vm.table_pairs(-1);
        self.vm.pop(1);
        match pairs {
            Ok(pairs) => {
                let mut lines = pairs
                    .iter()
                    .map(|(key, value)| {
                        format!(
                            "{} = {}",
                            self.vm.display(key),
                            self.vm.display(value)
                        )
                    })
                    .collect::<Vec<_>>();
                lines.sort();
                for line in lines {
                    println!("{line}");
                }
            }
            Err(err) => eprintln!("{err}"),
        }
    }

    fn evaluate(&mut self, line: &str) {
        let call = match parse(line) {
            Ok(call) => call,
            Err(err) => {
                report(line, &err.message, err.span, "here");
                return;
            }
        };
        let top = self.vm.top();
        let receiver = match self.push_function(&call) {
            Ok(receiver) => receiver,
            Err(err) => {
                self.vm.set_top(top);
                report(line, &err.message, err.span, "while looking up this function");
                return;
            }
        };
        if !self.vm.reserve_stack(call.arguments.len()) {
            self.vm.set_top(top);
            report(line, "too many arguments", call.path.1, "in this call");
            return;
        }
        for (literal, _) in &call.arguments {
            self.vm.push_value(literal.clone());
        }
        match self
            .vm
            .protected_call(receiver + call.arguments.len(), Results::All)
        {
            Status::Ok => {
                let results = (top + 1..=self.vm.top())
                    .filter_map(|index| StackIndex::try_from(index).ok())
                    .map(|index| self.vm.display(&self.vm.value(index)))
                    .collect::<Vec<_>>();
                if !results.is_empty() {
                    println!("{}", results.join("\t"));
                }
            }
            Status::Error => {
                let error = self.vm.value(-1);
                let message = self.vm.display(&error);
                let span = blamed_argument(&message)
                    .and_then(|position| position.checked_sub(receiver + 1))
                    .and_then(|position| call.arguments.get(position))
                    .map_or_else(|| call.path.1.clone(), |(_, span)| span.clone());
                report(line, &message, span, "raised here");
            }
        }
        self.vm.set_top(top);
    }

    /// Pushes the function named by `call.path`, following tables. When the
    /// last step looks up a method of an opaque object, the object is pushed
    /// after the method as its first argument. Returns the number of
    /// arguments pushed this way.
    fn push_function(&mut self, call: &Call) -> Result<usize, ParseError> {
        let (path, span) = &call.path;
        let failure = |message: String| ParseError {
            message,
            span: span.clone(),
        };
        if !self.vm.reserve_stack(2) {
            return Err(failure(String::from("the stack is full")));
        }
        let mut segments = path.split('.').peekable();
        let first = segments.next().unwrap_or_default();
        let mut kind = self.vm.get_global(first);
        let mut walked = String::from(first);
        let mut receiver = 0;
        while let Some(segment) = segments.next() {
            if !matches!(kind, Type::Table | Type::Opaque) {
                return Err(failure(format!("`{walked}` is a {kind}, not a table")));
            }
            let parent = kind;
            kind = self
                .vm
                .get_field(-1, segment)
                .map_err(|err| failure(err.to_string()))?;
            if parent == Type::Opaque && segments.peek().is_none() {
                self.vm.insert(-2);
                receiver = 1;
            } else {
                self.vm.remove(-2);
            }
            walked.push('.');
            walked.push_str(segment);
        }
        let function = if receiver == 0 { -1 } else { -2 };
        if self.vm.get_type(function) == Type::Function {
            Ok(receiver)
        } else {
            Err(failure(format!("`{walked}` is a {kind}, not a function")))
        }
    }
}

/// Returns the argument position of a `bad argument #n` message.
fn blamed_argument(message: &str) -> Option<usize> {
    let rest = message.strip_prefix("bad argument #")?;
    let digits = rest.split(':').next()?;
    digits.parse().ok().filter(|position| *position > 0)
}

fn report(line: &str, message: &str, span: Range<usize>, label: &str) {
    let result = Report::<Range<usize>>::build(ReportKind::Error, (), span.start)
        .with_message(message)
        .with_label(Label::new(span).with_message(label))
        .finish()
        .eprint(Source::from(line));
    if result.is_err() {
        eprintln!("error: {message}");
    }
}

#[derive(Debug)]
struct ParseError {
    message: String,
    span: Range<usize>,
}

#[derive(Debug)]
struct Call {
    path: (String, Range<usize>),
    arguments: Vec<(Value, Range<usize>)>,
}

fn parse(line: &str) -> Result<Call, ParseError> {
    let mut tokens = Tokens { line, offset: 0 };
    let path = match tokens.next() {
        Some(Ok(Token::Word(word, span))) => (String::from(word), span),
        Some(Ok(Token::String(_, span))) => {
            return Err(ParseError {
                message: String::from("expected a function name"),
                span,
            })
        }
        Some(Err(err)) => return Err(err),
        None => {
            return Err(ParseError {
                message: String::from("expected a function name"),
                span: 0..line.len(),
            })
        }
    };
    let mut arguments = Vec::new();
    for token in tokens {
        arguments.push(match token? {
            Token::String(value, span) => (Value::from(value), span),
            Token::Word(word, span) => (literal(word, span.clone())?, span),
        });
    }
    Ok(Call { path, arguments })
}

fn literal(word: &str, span: Range<usize>) -> Result<Value, ParseError> {
    match word {
        "nil" => Ok(Value::Nil),
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        _ => {
            if let Ok(int) = word.parse::<i64>() {
                Ok(Value::Int(int))
            } else if let Ok(float) = word.parse::<f64>() {
                Ok(Value::Float(float))
            } else {
                Err(ParseError {
                    message: format!("`{word}` is not a literal"),
                    span,
                })
            }
        }
    }
}

enum Token<'a> {
    Word(&'a str, Range<usize>),
    String(String, Range<usize>),
}

struct Tokens<'a> {
    line: &'a str,
    offset: usize,
}

impl<'a> Tokens<'a> {
    fn string(&mut self, start: usize) -> Result<Token<'a>, ParseError> {
        let mut value = String::new();
        let mut chars = self.line[start + 1..].char_indices();
        while let Some((index, ch)) = chars.next() {
            match ch {
                '"' => {
                    self.offset = start + 1 + index + 1;
                    return Ok(Token::String(value, start..self.offset));
                }
                '\\' => {
                    let escaped = match chars.next() {
                        Some((_, 'n')) => '\n',
                        Some((_, 't')) => '\t',
                        Some((_, ch @ ('"' | '\\'))) => ch,
                        Some((escape, other)) => {
                            let at = start + 1 + escape;
                            return Err(ParseError {
                                message: format!("unknown escape `\\{other}`"),
                                span: at - 1..at + other.len_utf8(),
                            });
                        }
                        None => break,
                    };
                    value.push(escaped);
                }
                ch => value.push(ch),
            }
        }
        self.offset = self.line.len();
        Err(ParseError {
            message: String::from("unterminated string"),
            span: start..self.line.len(),
        })
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Result<Token<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.line[self.offset..];
        let start = self.offset + (rest.len() - rest.trim_start().len());
        if start >= self.line.len() {
            return None;
        }
        if self.line[start..].starts_with('"') {
            return Some(self.string(start));
        }
        let end = self.line[start..]
            .find(char::is_whitespace)
            .map_or(self.line.len(), |len| start + len);
        self.offset = end;
        Some(Ok(Token::Word(&self.line[start..end], start..end)))
    }
}

fn history_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("ferry").join("history.txt"))
}
