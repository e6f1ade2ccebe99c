//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::sync::{Arc, Weak};

use codec::StructuredCloneData;
use manager_config::MessageManagerConfig;
use message_manager::{
    MessageManager, ProcessChecker, ProcessContext, ProcessKind, Result, TransportBinding,
    TransportKind,
};
use parking_lot::Mutex;

/// One observed binding call: (binding label, call kind, message name or url)
pub type CallLog = Arc<Mutex<Vec<(String, &'static str, String)>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Binding that records every call and answers blocking sends with fixed replies
pub struct RecordingBinding {
    label: String,
    log: CallLog,
    replies: Vec<String>,
    checker: Option<Arc<dyn ProcessChecker>>,
}

impl RecordingBinding {
    pub fn new(label: impl Into<String>, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            log: Arc::clone(log),
            replies: Vec::new(),
            checker: None,
        })
    }

    pub fn with_replies(label: impl Into<String>, log: &CallLog, replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            log: Arc::clone(log),
            replies: replies.iter().map(|r| r.to_string()).collect(),
            checker: None,
        })
    }

    pub fn with_checker(
        label: impl Into<String>,
        log: &CallLog,
        checker: Arc<dyn ProcessChecker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            log: Arc::clone(log),
            replies: Vec::new(),
            checker: Some(checker),
        })
    }

    fn record(&self, kind: &'static str, subject: &str) {
        self.log
            .lock()
            .push((self.label.clone(), kind, subject.to_string()));
    }
}

impl TransportBinding for RecordingBinding {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    fn connect(&self, _node: Weak<MessageManager>) {}

    fn send_blocking(
        &self,
        name: &str,
        _data: &StructuredCloneData,
        is_sync: bool,
    ) -> Result<Vec<String>> {
        self.record(if is_sync { "sync" } else { "rpc" }, name);
        Ok(self.replies.clone())
    }

    fn send_async(&self, name: &str, _data: &StructuredCloneData) -> Result<()> {
        self.record("async", name);
        Ok(())
    }

    fn load_script(&self, url: &str) -> Result<()> {
        self.record("script", url);
        Ok(())
    }

    fn process_checker(&self) -> Option<Arc<dyn ProcessChecker>> {
        self.checker.clone()
    }
}

pub fn binding(label: &str, log: &CallLog) -> Option<Arc<dyn TransportBinding>> {
    let binding: Arc<dyn TransportBinding> = RecordingBinding::new(label, log);
    Some(binding)
}

pub fn parent_context() -> Arc<ProcessContext> {
    ProcessContext::new(ProcessKind::Parent, MessageManagerConfig::default())
}

pub fn content_context() -> Arc<ProcessContext> {
    ProcessContext::new(ProcessKind::Content, MessageManagerConfig::default())
}

/// Labels of logged calls of `kind`, in order
pub fn calls(log: &CallLog, kind: &str) -> Vec<String> {
    log.lock()
        .iter()
        .filter(|(_, k, _)| *k == kind)
        .map(|(label, _, _)| label.clone())
        .collect()
}
