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


//! Trace filter: passes data through unchanged while recording it.
//!
//! Records go to a file (`file=<path>`, appending unless `delold` is given), to the standard
//! output (`stdout`) or to the standard error (`stderr`, the default). `dir` selects which
//! direction is recorded, and `raw` writes bare data instead of a timestamped hex dump.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::accepter::{gensio_gensio_accepter_alloc, Accepter, AccepterEvent, GensioAccepterHooks};
use crate::args::{check_keybool, check_keyvalue};
use crate::base::{base_gensio_alloc, Side};
use crate::filter::Filter;
use crate::gensio::{Gensio, GensioEvent};
use crate::ll::GensioLl;
use crate::os::OsFuncs;
use crate::registry::Registry;
use crate::timestamp::Timestamp;
use crate::Error;

const DUMP_LINE: usize = 16;

/// Which data get recorded.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display)]
pub enum TraceDir {
    #[default]
    #[display("none")]
    None,
    #[display("read")]
    Read,
    #[display("write")]
    Write,
    #[display("both")]
    Both,
}

impl TraceDir {
    pub fn traces_read(self) -> bool { matches!(self, TraceDir::Read | TraceDir::Both) }

    pub fn traces_write(self) -> bool { matches!(self, TraceDir::Write | TraceDir::Both) }
}

impl FromStr for TraceDir {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(TraceDir::None),
            "read" => Ok(TraceDir::Read),
            "write" => Ok(TraceDir::Write),
            "both" => Ok(TraceDir::Both),
            _ => Err(Error::Inval),
        }
    }
}

/// Options of the trace filter.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct TraceConfig {
    pub dir: TraceDir,
    pub raw: bool,
    pub file: Option<PathBuf>,
    pub stdout: bool,
    pub stderr: bool,
    /// Truncate the trace file instead of appending to it.
    pub delold: bool,
}

impl TraceConfig {
    pub fn from_args(args: &[String]) -> Result<Self, Error> {
        let mut config = TraceConfig::default();
        for arg in args {
            if let Some(dir) = check_keyvalue(arg, "dir") {
                config.dir = dir.parse()?;
            } else if let Some(raw) = check_keybool(arg, "raw")? {
                config.raw = raw;
            } else if let Some(path) = check_keyvalue(arg, "file") {
                config.file = Some(path.into());
            } else if let Some(val) = check_keybool(arg, "stdout")? {
                config.stdout = val;
            } else if let Some(val) = check_keybool(arg, "stderr")? {
                config.stderr = val;
            } else if let Some(val) = check_keybool(arg, "delold")? {
                config.delold = val;
            } else {
                #[cfg(feature = "log")]
                log::error!(target: "trace", "Unknown trace option '{arg}'");
                return Err(Error::Inval);
            }
        }
        Ok(config)
    }
}

/// Filter recording the data passing through it.
pub struct TraceFilter {
    config: TraceConfig,
    out: Option<Box<dyn Write + Send>>,
}

impl TraceFilter {
    pub fn new(config: TraceConfig) -> Self { TraceFilter { config, out: None } }

    fn open_output(&self) -> io::Result<Box<dyn Write + Send>> {
        if let Some(path) = &self.config.file {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(!self.config.delold)
                .truncate(self.config.delold)
                .open(path)?;
            return Ok(Box::new(file));
        }
        if self.config.stdout {
            return Ok(Box::new(io::stdout()));
        }
        Ok(Box::new(io::stderr()))
    }

    fn record(&mut self, op: &str, data: &[u8]) {
        let Some(out) = self.out.as_mut() else {
            return;
        };
        let res = if self.config.raw {
            out.write_all(data)
        } else {
            write_dump(out, op, data)
        };
        if let Err(err) = res.and_then(|_| out.flush()) {
            #[cfg(feature = "log")]
            log::warn!(target: "trace", "Unable to record {op} trace: {err}");
        }
    }
}

/// Writes a timestamped header followed by offset, hex and printable characters of `data`.
fn write_dump(out: &mut dyn Write, op: &str, data: &[u8]) -> io::Result<()> {
    writeln!(out, "{} {op} ({} bytes)", Timestamp::now(), data.len())?;
    for (no, line) in data.chunks(DUMP_LINE).enumerate() {
        let hex = line.iter().map(|byte| format!("{byte:02x}")).collect::<Vec<_>>().join(" ");
        let text = line
            .iter()
            .map(|byte| match byte {
                0x20..=0x7e => *byte as char,
                _ => '.',
            })
            .collect::<String>();
        writeln!(out, "  {:04x}: {hex:<width$}  {text}", no * DUMP_LINE, width = DUMP_LINE * 3 - 1)?;
    }
    Ok(())
}

impl Filter for TraceFilter {
    fn setup(&mut self) -> Result<(), Error> {
        if self.config.dir != TraceDir::None && self.out.is_none() {
            self.out = Some(self.open_output()?);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(mut out) = self.out.take() {
            let _ = out.flush();
        }
    }

    fn ul_write(&mut self, sg: &[&[u8]], out: &mut Vec<u8>) -> Result<usize, Error> {
        let start = out.len();
        for buf in sg {
            out.extend_from_slice(buf);
        }
        if self.config.dir.traces_write() {
            self.record("Write", &out[start..]);
        }
        Ok(out.len() - start)
    }

    fn ll_write(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<usize, Error> {
        out.extend_from_slice(data);
        if self.config.dir.traces_read() {
            self.record("Read", data);
        }
        Ok(data.len())
    }
}

/// Wraps `child` into a trace handle.
///
/// The trace handle takes its own reference to `child`; the caller keeps its reference whatever
/// the outcome.
pub fn trace_gensio_alloc(
    os: &OsFuncs,
    child: &Gensio,
    args: &[String],
    event: Option<Arc<dyn GensioEvent>>,
) -> Result<Gensio, Error> {
    let filter = TraceFilter::new(TraceConfig::from_args(args)?);
    let ll = GensioLl::new(child);
    Ok(base_gensio_alloc(
        os,
        Box::new(ll),
        Box::new(filter),
        Some(child),
        "trace",
        Side::Client,
        event,
    ))
}

/// Descriptor factory: `trace(<options>),<child descriptor>`.
pub fn str_to_trace_gensio(
    registry: &Registry,
    rest: &str,
    args: &[String],
    event: Option<Arc<dyn GensioEvent>>,
) -> Result<Gensio, Error> {
    let child = registry.str_to_gensio(rest, None)?;
    trace_gensio_alloc(registry.os(), &child, args, event)
}

struct TraceAccepterHooks {
    os: OsFuncs,
    args: Vec<String>,
}

impl GensioAccepterHooks for TraceAccepterHooks {
    fn new_child(&self) -> Result<Box<dyn Filter>, Error> {
        Ok(Box::new(TraceFilter::new(TraceConfig::from_args(&self.args)?)))
    }

    fn finish_parent(&self, io: &Gensio) -> Result<(), Error> {
        io.set_attr_from_child();
        Ok(())
    }

    fn alloc_gensio(
        &self,
        args: &[String],
        child: &Gensio,
        event: Option<Arc<dyn GensioEvent>>,
    ) -> Result<Gensio, Error> {
        trace_gensio_alloc(&self.os, child, args, event)
    }
}

/// Wraps `child` into a trace accepter, which traces every connection it accepts using `args`.
pub fn trace_gensio_accepter_alloc(
    os: &OsFuncs,
    child: Accepter,
    args: &[String],
    event: Option<Arc<dyn AccepterEvent>>,
) -> Result<Accepter, Error> {
    TraceConfig::from_args(args)?;
    let hooks = TraceAccepterHooks {
        os: os.clone(),
        args: args.to_vec(),
    };
    Ok(gensio_gensio_accepter_alloc(child, os, "trace", event, Box::new(hooks)))
}

/// Descriptor factory: `trace(<options>),<child accepter descriptor>`.
pub fn str_to_trace_gensio_accepter(
    registry: &Registry,
    rest: &str,
    args: &[String],
    event: Option<Arc<dyn AccepterEvent>>,
) -> Result<Accepter, Error> {
    let child = registry.str_to_accepter(rest, None)?;
    trace_gensio_accepter_alloc(registry.os(), child, args, event)
}
