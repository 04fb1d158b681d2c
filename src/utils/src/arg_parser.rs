// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A minimal `--flag value` command line parser.

use std::collections::BTreeMap;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

const ARG_PREFIX: &str = "--";
const HELP_ARG: &str = "--help";

/// Errors associated with parsing and validating arguments.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// The required argument was not provided.
    MissingArgument(String),
    /// A value for the argument was not provided.
    MissingValue(String),
    /// The provided argument was not expected.
    UnexpectedArgument(String),
    /// The argument was provided more than once.
    DuplicateArgument(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::MissingArgument(arg) => {
                write!(f, "Argument '{}' required, but not found.", arg)
            }
            Error::MissingValue(arg) => write!(
                f,
                "The argument '{}' requires a value, but none was supplied.",
                arg
            ),
            Error::UnexpectedArgument(arg) => {
                write!(f, "Found argument '{}' which wasn't expected.", arg)
            }
            Error::DuplicateArgument(arg) => {
                write!(f, "The argument '{}' was provided more than once.", arg)
            }
        }
    }
}

/// Describes one accepted command line argument.
#[derive(Clone, Debug, Default)]
pub struct Argument {
    name: &'static str,
    required: bool,
    takes_value: bool,
    default_value: Option<&'static str>,
    help: &'static str,
    user_value: Option<String>,
    provided: bool,
}

impl Argument {
    /// Creates an argument named `name`, matched on the command line as
    /// `--name`.
    pub fn new(name: &'static str) -> Argument {
        Argument {
            name,
            ..Default::default()
        }
    }

    /// Marks the argument as mandatory.
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Marks the argument as expecting a value token after it.
    pub fn takes_value(mut self, takes_value: bool) -> Self {
        self.takes_value = takes_value;
        self
    }

    /// Sets the value used when the argument is absent.
    pub fn default_value(mut self, default_value: &'static str) -> Self {
        self.default_value = Some(default_value);
        self.takes_value = true;
        self
    }

    /// Sets the help text shown by `formatted_help`.
    pub fn help(mut self, help: &'static str) -> Self {
        self.help = help;
        self
    }

    fn format_help(&self) -> String {
        if self.takes_value {
            format!("  --{} <{}>: {}", self.name, self.name, self.help)
        } else {
            format!("  --{}: {}", self.name, self.help)
        }
    }
}

/// Holds the accepted arguments and, after `parse`, their values.
#[derive(Clone, Debug, Default)]
pub struct ArgParser {
    args: BTreeMap<&'static str, Argument>,
    help_requested: bool,
}

impl ArgParser {
    /// Creates a parser that accepts no arguments yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `argument` with the parser.
    pub fn arg(mut self, argument: Argument) -> Self {
        self.args.insert(argument.name, argument);
        self
    }

    /// Parses the process command line, skipping the binary name.
    pub fn parse_from_cmdline(&mut self) -> Result<()> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        self.parse(&args)
    }

    /// Parses the given tokens.
    pub fn parse(&mut self, tokens: &[String]) -> Result<()> {
        let mut iter = tokens.iter();
        while let Some(token) = iter.next() {
            if token == HELP_ARG {
                self.help_requested = true;
                return Ok(());
            }
            let name = token
                .strip_prefix(ARG_PREFIX)
                .ok_or_else(|| Error::UnexpectedArgument(token.clone()))?;
            let arg = self
                .args
                .get_mut(name)
                .ok_or_else(|| Error::UnexpectedArgument(token.clone()))?;
            if arg.provided {
                return Err(Error::DuplicateArgument(name.to_string()));
            }
            arg.provided = true;
            if arg.takes_value {
                let value = iter
                    .next()
                    .filter(|v| !v.starts_with(ARG_PREFIX))
                    .ok_or_else(|| Error::MissingValue(name.to_string()))?;
                arg.user_value = Some(value.clone());
            }
        }

        for arg in self.args.values() {
            if arg.required && !arg.provided {
                return Err(Error::MissingArgument(arg.name.to_string()));
            }
        }
        Ok(())
    }

    /// Returns `true` if `--help` appeared on the command line.
    pub fn help_requested(&self) -> bool {
        self.help_requested
    }

    /// Returns the value of `name`, falling back to its default.
    pub fn value_as_string(&self, name: &'static str) -> Option<String> {
        self.args.get(name).and_then(|arg| {
            arg.user_value
                .clone()
                .or_else(|| arg.default_value.map(String::from))
        })
    }

    /// Returns `true` if the flag `name` was present.
    pub fn flag_present(&self, name: &'static str) -> bool {
        self.args.get(name).map_or(false, |arg| arg.provided)
    }

    /// Builds the usage message from the registered arguments.
    pub fn formatted_help(&self) -> String {
        let mut lines = vec![];

        let required: Vec<String> = self
            .args
            .values()
            .filter(|a| a.required)
            .map(Argument::format_help)
            .collect();
        if !required.is_empty() {
            lines.push("required arguments:".to_string());
            lines.extend(required);
        }

        let optional: Vec<String> = self
            .args
            .values()
            .filter(|a| !a.required)
            .map(Argument::format_help)
            .collect();
        if !optional.is_empty() {
            if !lines.is_empty() {
                lines.push(String::new());
            }
            lines.push("optional arguments:".to_string());
            lines.extend(optional);
        }
        lines.join("\n")
    }
}
