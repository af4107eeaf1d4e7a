// Layered stream I/O runtime: stackable filters over arbitrary transports.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.


//! Named transport and filter factories.
//!
//! A [`Registry`] maps names to factories, so handles and accepters can be built out of textual
//! descriptors of the form `name(option,option,...),nested-descriptor`. Options are `key=value`
//! pairs or bare flags; double quotes protect commas and parentheses inside option values.
//! Several independent registries may coexist in one process.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::accepter::{Accepter, AccepterEvent};
use crate::file::str_to_file_gensio;
use crate::gensio::{Gensio, GensioEvent};
use crate::os::OsFuncs;
use crate::trace::{
    str_to_trace_gensio, str_to_trace_gensio_accepter, trace_gensio_accepter_alloc,
    trace_gensio_alloc,
};
use crate::Error;

/// Builds a handle from the options and the nested descriptor following the factory name.
pub type StrToGensio =
    fn(&Registry, &str, &[String], Option<Arc<dyn GensioEvent>>) -> Result<Gensio, Error>;

/// Stacks a filter handle over an existing child handle.
pub type GensioAlloc =
    fn(&Registry, &Gensio, &[String], Option<Arc<dyn GensioEvent>>) -> Result<Gensio, Error>;

/// Builds an accepter from the options and the nested descriptor following the factory name.
pub type StrToAccepter =
    fn(&Registry, &str, &[String], Option<Arc<dyn AccepterEvent>>) -> Result<Accepter, Error>;

/// Stacks a filter accepter over an existing child accepter.
pub type AccepterAlloc =
    fn(&Registry, Accepter, &[String], Option<Arc<dyn AccepterEvent>>) -> Result<Accepter, Error>;

/// Parsed head of a descriptor.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Descriptor<'a> {
    pub name: &'a str,
    pub args: Vec<String>,
    /// Descriptor of the next layer down, empty for leaf transports.
    pub rest: &'a str,
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl<'a> Descriptor<'a> {
    pub fn parse(desc: &'a str) -> Result<Self, Error> {
        let desc = desc.trim();
        let end = desc.find(|c| c == '(' || c == ',').unwrap_or(desc.len());
        let name = desc[..end].trim_end();
        if !is_valid_name(name) {
            return Err(Error::Inval);
        }

        let mut rest = &desc[end..];
        let mut args = vec![];
        if let Some(inner) = rest.strip_prefix('(') {
            let (options, close) = split_options(inner)?;
            args = options;
            rest = &inner[close + 1..];
        }
        let rest = match rest.strip_prefix(',') {
            Some(nested) => nested.trim_start(),
            None if rest.trim().is_empty() => "",
            None => return Err(Error::Inval),
        };
        Ok(Descriptor { name, args, rest })
    }
}

/// Splits the options up to the closing parenthesis. Returns the options and the position of
/// the parenthesis.
fn split_options(s: &str) -> Result<(Vec<String>, usize), Error> {
    let mut args = vec![];
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut chars = s.char_indices();
    while let Some((pos, c)) = chars.next() {
        match c {
            '\\' if in_quote => current.push(chars.next().ok_or(Error::Inval)?.1),
            '"' => in_quote = !in_quote,
            _ if in_quote => current.push(c),
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' if depth == 0 => {
                let arg = current.trim();
                if !arg.is_empty() {
                    args.push(arg.to_owned());
                }
                return Ok((args, pos));
            }
            ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                let arg = current.trim();
                if !arg.is_empty() {
                    args.push(arg.to_owned());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    Err(Error::Inval)
}

#[derive(Copy, Clone)]
struct GensioEntry {
    str_to: StrToGensio,
    alloc: Option<GensioAlloc>,
}

#[derive(Copy, Clone)]
struct AccepterEntry {
    str_to: StrToAccepter,
    alloc: Option<AccepterAlloc>,
}

/// Lookup table of handle and accepter factories bound to an OS layer instance.
pub struct Registry {
    os: OsFuncs,
    gensios: BTreeMap<String, GensioEntry>,
    accepters: BTreeMap<String, AccepterEntry>,
}

impl Registry {
    /// Constructs an empty registry.
    pub fn new(os: &OsFuncs) -> Self {
        Registry {
            os: os.clone(),
            gensios: empty!(),
            accepters: empty!(),
        }
    }

    /// Constructs a registry knowing the `file` transport and the `trace` filter.
    pub fn with_defaults(os: &OsFuncs) -> Result<Self, Error> {
        let mut registry = Registry::new(os);
        registry.register_gensio("file", str_to_file_gensio)?;
        registry.register_filter_gensio("trace", str_to_trace_gensio, |registry, child, args, event| {
            trace_gensio_alloc(registry.os(), child, args, event)
        })?;
        registry.register_filter_gensio_accepter(
            "trace",
            str_to_trace_gensio_accepter,
            |registry, child, args, event| {
                trace_gensio_accepter_alloc(registry.os(), child, args, event)
            },
        )?;
        Ok(registry)
    }

    pub fn os(&self) -> &OsFuncs { &self.os }

    fn add_gensio(&mut self, name: &str, entry: GensioEntry) -> Result<(), Error> {
        if !is_valid_name(name) {
            return Err(Error::Inval);
        }
        if self.gensios.contains_key(name) {
            #[cfg(feature = "log")]
            log::error!(target: "registry", "Handle type '{name}' is already registered");
            return Err(Error::Exists);
        }
        #[cfg(feature = "log")]
        log::debug!(target: "registry", "Registering handle type '{name}'");
        self.gensios.insert(name.to_owned(), entry);
        Ok(())
    }

    fn add_accepter(&mut self, name: &str, entry: AccepterEntry) -> Result<(), Error> {
        if !is_valid_name(name) {
            return Err(Error::Inval);
        }
        if self.accepters.contains_key(name) {
            #[cfg(feature = "log")]
            log::error!(target: "registry", "Accepter type '{name}' is already registered");
            return Err(Error::Exists);
        }
        #[cfg(feature = "log")]
        log::debug!(target: "registry", "Registering accepter type '{name}'");
        self.accepters.insert(name.to_owned(), entry);
        Ok(())
    }

    /// Registers a leaf transport.
    ///
    /// # Errors
    ///
    /// [`Error::Exists`] if a handle type with the same name is already registered.
    pub fn register_gensio(&mut self, name: &str, str_to: StrToGensio) -> Result<(), Error> {
        self.add_gensio(name, GensioEntry {
            str_to,
            alloc: None,
        })
    }

    /// Registers a filter handle type, which can also be stacked over an existing handle.
    pub fn register_filter_gensio(
        &mut self,
        name: &str,
        str_to: StrToGensio,
        alloc: GensioAlloc,
    ) -> Result<(), Error> {
        self.add_gensio(name, GensioEntry {
            str_to,
            alloc: Some(alloc),
        })
    }

    pub fn register_gensio_accepter(&mut self, name: &str, str_to: StrToAccepter) -> Result<(), Error> {
        self.add_accepter(name, AccepterEntry {
            str_to,
            alloc: None,
        })
    }

    pub fn register_filter_gensio_accepter(
        &mut self,
        name: &str,
        str_to: StrToAccepter,
        alloc: AccepterAlloc,
    ) -> Result<(), Error> {
        self.add_accepter(name, AccepterEntry {
            str_to,
            alloc: Some(alloc),
        })
    }

    pub fn gensio_names(&self) -> impl Iterator<Item = &str> { self.gensios.keys().map(String::as_str) }

    pub fn accepter_names(&self) -> impl Iterator<Item = &str> {
        self.accepters.keys().map(String::as_str)
    }

    /// Builds a handle stack out of a descriptor.
    ///
    /// # Errors
    ///
    /// [`Error::Inval`] for malformed descriptors or options, [`Error::NotFound`] for unknown
    /// handle types, and any error of the factories involved.
    pub fn str_to_gensio(&self, desc: &str, event: Option<Arc<dyn GensioEvent>>) -> Result<Gensio, Error> {
        let Descriptor { name, args, rest } = Descriptor::parse(desc)?;
        let entry = *self.gensios.get(name).ok_or(Error::NotFound)?;

        #[cfg(feature = "log")]
        log::debug!(target: "registry", "Building '{name}' handle with options {args:?}");

        (entry.str_to)(self, rest, &args, event)
    }

    /// Stacks the filter handle type `name` over `child`. The caller keeps its reference to
    /// `child`.
    ///
    /// # Errors
    ///
    /// [`Error::NotSup`] if `name` is a leaf transport.
    pub fn gensio_alloc(
        &self,
        name: &str,
        child: &Gensio,
        args: &[String],
        event: Option<Arc<dyn GensioEvent>>,
    ) -> Result<Gensio, Error> {
        let entry = self.gensios.get(name).ok_or(Error::NotFound)?;
        let alloc = entry.alloc.ok_or(Error::NotSup)?;
        alloc(self, child, args, event)
    }

    /// Builds an accepter stack out of a descriptor.
    pub fn str_to_accepter(
        &self,
        desc: &str,
        event: Option<Arc<dyn AccepterEvent>>,
    ) -> Result<Accepter, Error> {
        let Descriptor { name, args, rest } = Descriptor::parse(desc)?;
        let entry = *self.accepters.get(name).ok_or(Error::NotFound)?;

        #[cfg(feature = "log")]
        log::debug!(target: "registry", "Building '{name}' accepter with options {args:?}");

        (entry.str_to)(self, rest, &args, event)
    }

    /// Stacks the filter accepter type `name` over `child`.
    pub fn accepter_alloc(
        &self,
        name: &str,
        child: Accepter,
        args: &[String],
        event: Option<Arc<dyn AccepterEvent>>,
    ) -> Result<Accepter, Error> {
        let entry = self.accepters.get(name).ok_or(Error::NotFound)?;
        let alloc = entry.alloc.ok_or(Error::NotSup)?;
        alloc(self, child, args, event)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{self, last_mock_accepter, AcceptCollector, Tally};

    #[test]
    fn parse() {
        let desc = Descriptor::parse("trace(dir=both, raw),file(infile=/a)").unwrap();
        assert_eq!(desc.name, "trace");
        assert_eq!(desc.args, vec![s!("dir=both"), s!("raw")]);
        assert_eq!(desc.rest, "file(infile=/a)");

        let desc = Descriptor::parse(desc.rest).unwrap();
        assert_eq!(desc.name, "file");
        assert_eq!(desc.args, vec![s!("infile=/a")]);
        assert_eq!(desc.rest, "");

        let desc = Descriptor::parse("trace,file").unwrap();
        assert_eq!((desc.name, desc.args.len(), desc.rest), ("trace", 0, "file"));
        assert_eq!(Descriptor::parse("file()").unwrap().args.len(), 0);

        let desc = Descriptor::parse(r#"trace(file="/tmp/a,b(c", dir=read),file"#).unwrap();
        assert_eq!(desc.args, vec![s!("file=/tmp/a,b(c"), s!("dir=read")]);
        let desc = Descriptor::parse("x(opt=(a,b),c)").unwrap();
        assert_eq!(desc.args, vec![s!("opt=(a,b)"), s!("c")]);
    }

    #[test]
    fn parse_errors() {
        for desc in ["", "(a)", "x(y", "x)y", "trace(a)b", "a b", r#"x("open)"#] {
            assert_eq!(Descriptor::parse(desc), Err(Error::Inval), "{desc}");
        }
    }

    #[test]
    fn registration() {
        let os = OsFuncs::new().unwrap();
        let mut registry = Registry::with_defaults(&os).unwrap();
        assert_eq!(registry.gensio_names().collect::<Vec<_>>(), vec!["file", "trace"]);
        assert_eq!(registry.accepter_names().collect::<Vec<_>>(), vec!["trace"]);
        assert_eq!(registry.register_gensio("file", str_to_file_gensio), Err(Error::Exists));
        assert_eq!(registry.register_gensio("bad name", str_to_file_gensio), Err(Error::Inval));
        registry.register_gensio("file2", str_to_file_gensio).unwrap();
        assert!(registry.str_to_gensio("file2", None).is_ok());
        assert_eq!(Registry::new(&os).gensio_names().count(), 0);
    }

    #[test]
    fn lookup_errors() {
        let os = OsFuncs::new().unwrap();
        let registry = Registry::with_defaults(&os).unwrap();
        assert_eq!(registry.str_to_gensio("tcp(port=1)", None).unwrap_err(), Error::NotFound);
        assert_eq!(registry.str_to_gensio("trace,nope", None).unwrap_err(), Error::NotFound);
        assert_eq!(registry.str_to_gensio("file(colour=red)", None).unwrap_err(), Error::Inval);
        assert_eq!(registry.str_to_gensio("file,file", None).unwrap_err(), Error::Inval);
        assert_eq!(registry.str_to_accepter("file", None).unwrap_err(), Error::NotFound);

        let io = registry.str_to_gensio("file", None).unwrap();
        assert_eq!(registry.gensio_alloc("file", &io, &[], None).unwrap_err(), Error::NotSup);
        assert_eq!(registry.gensio_alloc("nope", &io, &[], None).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn filter_alloc_over_child() {
        let os = OsFuncs::new().unwrap();
        let registry = testing::registry(&os);
        let tally = Tally::default();
        let child = testing::CountingGensio::alloc(&os, &tally);
        let io = registry.gensio_alloc("trace", &child, &[s!("dir=none")], None).unwrap();
        assert_eq!(tally.refcount(), 2);
        drop(io);
        assert_eq!(tally.refcount(), 1);
    }

    #[test]
    fn accepter_descriptor() {
        let os = OsFuncs::new().unwrap();
        let registry = testing::registry(&os);
        let collector = AcceptCollector::new(&os);
        let acc = registry.str_to_accepter("trace(dir=none),mock", Some(collector.clone())).unwrap();
        assert_eq!(acc.type_name(), "trace");
        assert_eq!(acc.child(1).unwrap().type_name(), "mock");
        let mock = last_mock_accepter().unwrap();
        acc.startup().unwrap();
        assert!(mock.started());

        let tally = Tally::default();
        mock.connect(&tally);
        let handles = collector.wait_for(1, Duration::from_secs(5)).unwrap();
        assert_eq!(handles[0].child(1).unwrap().type_name(), "counting");

        let wrapped = registry.accepter_alloc("trace", acc.clone(), &[], None).unwrap();
        assert_eq!(wrapped.child(2).unwrap().type_name(), "mock");
        assert_eq!(registry.accepter_alloc("mock", acc, &[], None).unwrap_err(), Error::NotSup);
    }
}
