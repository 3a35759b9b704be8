use crate::backend::{BackendError, FetchBackend, FetchRead};
use crate::config::InterestOptions;
use crate::helpers::lock;
use crate::name::ContentName;
use log::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// One scripted outcome of [`FetchBackend::read`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scripted {
    /// Content to deliver. If the reader's buffer is smaller, the rest is delivered by the following reads.
    Data(Vec<u8>),
    NoDataYet,
    Timeout,
    End,
    Failed(i32),
}

/// Counters for every call the transport makes into a [`ScriptedFetch`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptedStats {
    pub connects: usize,
    pub reads: usize,
    pub pumps: usize,
    pub timeout_resets: usize,
    pub fetch_closes: usize,
    pub template_destroys: usize,
    pub name_destroys: usize,
    pub connection_destroys: usize,
}

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    reads: AtomicUsize,
    pumps: AtomicUsize,
    timeout_resets: AtomicUsize,
    fetch_closes: AtomicUsize,
    template_destroys: AtomicUsize,
    name_destroys: AtomicUsize,
    connection_destroys: AtomicUsize,
}

fn bump(counter: &AtomicUsize) -> usize {
    counter.fetch_add(1, Ordering::SeqCst) + 1
}

pub struct ScriptedConnection {
    id: usize,
}

pub struct ScriptedName(String);

pub struct ScriptedTemplate(InterestOptions);

pub struct ScriptedStream {
    name: String,
}

/// An in-memory fetch library whose read outcomes are dictated, in order, by a script.
///
/// Once the script runs dry every read returns the *idle* outcome ([`Scripted::End`] unless changed with
/// [`ScriptedFetch::idle_with`]).
///
/// Names containing an empty component (`//`) are rejected by [`FetchBackend::resolve_name`], the way a real resolver
/// rejects names it cannot encode.
pub struct ScriptedFetch {
    script: Mutex<VecDeque<Scripted>>,
    idle: Scripted,
    available: bool,
    pump_delay: Duration,
    pump_failure: Option<i32>,
    opened: Mutex<Vec<(String, InterestOptions)>>,
    teardown: Mutex<Vec<&'static str>>,
    counters: Counters,
}

impl Default for ScriptedFetch {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedFetch {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            idle: Scripted::End,
            available: true,
            pump_delay: Duration::ZERO,
            pump_failure: None,
            opened: Mutex::new(Vec::new()),
            teardown: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// Scripts `content` to be delivered in chunks of (at most) `chunk` bytes, followed by the end of the stream.
    pub fn serving(content: &[u8], chunk: usize) -> Self {
        let fetch = Self::new();
        for piece in content.chunks(chunk.max(1)) {
            fetch.push(Scripted::Data(piece.to_vec()));
        }
        fetch.push(Scripted::End);
        fetch
    }

    /// Makes [`FetchBackend::connect`] fail, as if no forwarder were running.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn idle_with(mut self, outcome: Scripted) -> Self {
        self.idle = outcome;
        self
    }

    /// Makes every pump iteration take `delay`, standing in for the library waiting on the network.
    pub fn with_pump_delay(mut self, delay: Duration) -> Self {
        self.pump_delay = delay;
        self
    }

    /// Makes every pump iteration fail with `code`.
    pub fn with_pump_failure(mut self, code: i32) -> Self {
        self.pump_failure = Some(code);
        self
    }

    pub fn push(&self, outcome: Scripted) {
        lock(&self.script).push_back(outcome);
    }

    pub fn stats(&self) -> ScriptedStats {
        let c = &self.counters;
        ScriptedStats {
            connects: c.connects.load(Ordering::SeqCst),
            reads: c.reads.load(Ordering::SeqCst),
            pumps: c.pumps.load(Ordering::SeqCst),
            timeout_resets: c.timeout_resets.load(Ordering::SeqCst),
            fetch_closes: c.fetch_closes.load(Ordering::SeqCst),
            template_destroys: c.template_destroys.load(Ordering::SeqCst),
            name_destroys: c.name_destroys.load(Ordering::SeqCst),
            connection_destroys: c.connection_destroys.load(Ordering::SeqCst),
        }
    }

    /// The names fetch streams were opened for, with the options they were opened with.
    pub fn opened(&self) -> Vec<(String, InterestOptions)> {
        lock(&self.opened).clone()
    }

    /// The order in which handles were handed back for destruction.
    pub fn teardown_order(&self) -> Vec<&'static str> {
        lock(&self.teardown).clone()
    }

    fn next_outcome(&self, capacity: usize) -> Scripted {
        let mut script = lock(&self.script);
        match script.pop_front() {
            Some(Scripted::Data(mut bytes)) if bytes.len() > capacity => {
                let rest = bytes.split_off(capacity);
                script.push_front(Scripted::Data(rest));
                Scripted::Data(bytes)
            }
            Some(outcome) => outcome,
            None => self.idle.clone(),
        }
    }

    fn record_teardown(&self, what: &'static str) {
        lock(&self.teardown).push(what);
    }
}

impl FetchBackend for ScriptedFetch {
    type Connection = ScriptedConnection;
    type Name = ScriptedName;
    type Template = ScriptedTemplate;
    type Stream = ScriptedStream;

    fn connect(&self) -> Result<Self::Connection, BackendError> {
        if !self.available {
            return Err(BackendError::new(-1, "no forwarder is listening"));
        }
        let id = bump(&self.counters.connects);
        trace!("Scripted connection #{id} established");
        Ok(ScriptedConnection { id })
    }

    fn resolve_name(&self, name: &ContentName) -> Result<Self::Name, BackendError> {
        if name.as_str().contains("//") {
            return Err(BackendError::new(-1, "empty name component"));
        }
        Ok(ScriptedName(name.to_string()))
    }

    fn make_template(&self, options: &InterestOptions) -> Self::Template {
        ScriptedTemplate(options.clone())
    }

    fn open_fetch(
        &self,
        connection: &mut Self::Connection,
        name: &Self::Name,
        template: &Self::Template,
        options: &InterestOptions,
    ) -> Result<Self::Stream, BackendError> {
        trace!("Opening scripted fetch for {} on connection #{}", name.0, connection.id);
        let mut merged = options.clone();
        merged.allow_stale = template.0.allow_stale;
        merged.max_suffix_components = template.0.max_suffix_components;
        lock(&self.opened).push((name.0.clone(), merged));
        Ok(ScriptedStream { name: name.0.clone() })
    }

    fn read(&self, stream: &mut Self::Stream, buf: &mut [u8]) -> FetchRead {
        bump(&self.counters.reads);
        match self.next_outcome(buf.len()) {
            Scripted::Data(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                trace!("Scripted read of {} bytes for {}", bytes.len(), stream.name);
                FetchRead::Data(bytes.len())
            }
            Scripted::NoDataYet => FetchRead::NoDataYet,
            Scripted::Timeout => FetchRead::Timeout,
            Scripted::End => FetchRead::End,
            Scripted::Failed(code) => FetchRead::Failed(code),
        }
    }

    fn reset_timeout(&self, _stream: &mut Self::Stream) {
        bump(&self.counters.timeout_resets);
    }

    fn pump_once(&self, _connection: &mut Self::Connection, timeout: Duration) -> Result<(), BackendError> {
        bump(&self.counters.pumps);
        if !self.pump_delay.is_zero() {
            thread::sleep(self.pump_delay.min(timeout));
        }
        match self.pump_failure {
            Some(code) => Err(BackendError::new(code, "pump failed")),
            None => Ok(()),
        }
    }

    fn close_fetch(&self, _stream: Self::Stream) {
        bump(&self.counters.fetch_closes);
        self.record_teardown("fetch");
    }

    fn destroy_template(&self, _template: Self::Template) {
        bump(&self.counters.template_destroys);
        self.record_teardown("template");
    }

    fn destroy_name(&self, _name: Self::Name) {
        bump(&self.counters.name_destroys);
        self.record_teardown("name");
    }

    fn destroy_connection(&self, _connection: Self::Connection) {
        bump(&self.counters.connection_destroys);
        self.record_teardown("connection");
    }
}
