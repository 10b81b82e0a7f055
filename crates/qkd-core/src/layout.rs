//! Named pipes and key-file directories under the data root.
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use qkd_exec::prelude::{drain_fifo, make_fifo};
use qkd_model::Epoch;
use tracing::{debug, trace};

use crate::error::CoreResult;

/// Every FIFO the pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fifo {
    /// Messages to the partner (read by the transfer program).
    MsgIn,
    /// Messages from the partner (written by the transfer program).
    MsgOut,
    RawEvents,
    T1Log,
    T3Log,
    SpliceCmd,
    SplicerLog,
    /// Epochs the transfer program should ship to the partner.
    TransferCmd,
    TransferLog,
    MatcherCmd,
    MatcherLog,
    GenLog,
    EcCmd,
    EcSend,
    EcReceive,
    EcNote,
    EcQuery,
    EcResponse,
}

impl Fifo {
    pub const ALL: [Fifo; 18] = [
        Fifo::MsgIn,
        Fifo::MsgOut,
        Fifo::RawEvents,
        Fifo::T1Log,
        Fifo::T3Log,
        Fifo::SpliceCmd,
        Fifo::SplicerLog,
        Fifo::TransferCmd,
        Fifo::TransferLog,
        Fifo::MatcherCmd,
        Fifo::MatcherLog,
        Fifo::GenLog,
        Fifo::EcCmd,
        Fifo::EcSend,
        Fifo::EcReceive,
        Fifo::EcNote,
        Fifo::EcQuery,
        Fifo::EcResponse,
    ];

    /// FIFOs owned by the partner session; they outlive key generation.
    pub fn is_relay(&self) -> bool {
        matches!(self, Fifo::MsgIn | Fifo::MsgOut | Fifo::TransferCmd | Fifo::TransferLog)
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            Fifo::MsgIn => "msgin",
            Fifo::MsgOut => "msgout",
            Fifo::RawEvents => "rawevents",
            Fifo::T1Log => "t1logpipe",
            Fifo::T3Log => "t3logpipe",
            Fifo::SpliceCmd => "splicepipe",
            Fifo::SplicerLog => "splicer_log",
            Fifo::TransferCmd => "cmdpipe",
            Fifo::TransferLog => "transferlog",
            Fifo::MatcherCmd => "costream_cmd",
            Fifo::MatcherLog => "costream_log",
            Fifo::GenLog => "genlog",
            Fifo::EcCmd => "eccmdpipe",
            Fifo::EcSend => "ecspipe",
            Fifo::EcReceive => "ecrpipe",
            Fifo::EcNote => "ecnotepipe",
            Fifo::EcQuery => "ecquery",
            Fifo::EcResponse => "ecresp",
        }
    }
}

/// Key-file directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDir {
    /// Outgoing files picked up by the transfer program.
    Send,
    /// Files received from the partner.
    Receive,
    T1,
    T3,
    RawKey,
    FinalKey,
}

impl KeyDir {
    pub const ALL: [KeyDir; 6] = [
        KeyDir::Send,
        KeyDir::Receive,
        KeyDir::T1,
        KeyDir::T3,
        KeyDir::RawKey,
        KeyDir::FinalKey,
    ];

    /// Directories holding in-flight transfer data, wiped before every start.
    pub const TRANSFER: [KeyDir; 4] = [KeyDir::Send, KeyDir::Receive, KeyDir::T1, KeyDir::T3];

    pub fn dir_name(&self) -> &'static str {
        match self {
            KeyDir::Send => "sendfiles",
            KeyDir::Receive => "receivefiles",
            KeyDir::T1 => "t1",
            KeyDir::T3 => "t3",
            KeyDir::RawKey => "rawkey",
            KeyDir::FinalKey => "finalkey",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fifo(&self, fifo: Fifo) -> PathBuf {
        self.root.join(fifo.file_name())
    }

    pub fn dir(&self, dir: KeyDir) -> PathBuf {
        self.root.join(dir.dir_name())
    }

    /// Path of a raw key file for `epoch`.
    pub fn raw_key(&self, epoch: Epoch) -> PathBuf {
        self.dir(KeyDir::RawKey).join(epoch.to_string())
    }

    /// (Re)create the root, every directory and every FIFO.
    pub fn prepare(&self) -> CoreResult<()> {
        fs::create_dir_all(&self.root)?;
        for dir in KeyDir::ALL {
            fs::create_dir_all(self.dir(dir))?;
        }
        for fifo in Fifo::ALL {
            make_fifo(&self.fifo(fifo))?;
        }
        debug!(target: "qkd.core.layout", root = %self.root.display(), "data root prepared");
        Ok(())
    }

    /// Remove stale files from the transfer directories.
    pub fn clear_transfer_dirs(&self) -> CoreResult<usize> {
        let mut removed = 0;
        for dir in KeyDir::TRANSFER {
            removed += clear_dir(&self.dir(dir))?;
        }
        trace!(target: "qkd.core.layout", removed, "transfer directories cleared");
        Ok(removed)
    }

    /// Discard buffered data in every stage FIFO.
    pub fn drain(&self) {
        for fifo in Fifo::ALL.into_iter().filter(|f| !f.is_relay()) {
            let path = self.fifo(fifo);
            match drain_fifo(&path) {
                Ok(0) => {}
                Ok(n) => trace!(target: "qkd.core.layout", fifo = fifo.file_name(), bytes = n, "drained"),
                Err(e) => trace!(target: "qkd.core.layout", fifo = fifo.file_name(), error = %e, "drain skipped"),
            }
        }
    }
}

fn clear_dir(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(dir)?;
            return Ok(0);
        }
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed += 1;
    }
    Ok(removed)
}
