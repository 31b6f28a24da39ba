//! Scripted model double for pipeline tests.
//!
//! Every distinct text embeds to its own unit axis, so unrelated texts have
//! similarity 0.  Tests pin explicit vectors for texts that should be close.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use mnemo_llm::{CompletionOptions, ModelClient};

pub const DIM: usize = 256;

#[derive(Default)]
pub struct ScriptedModel {
    pinned: Mutex<HashMap<String, Vec<f32>>>,
    axes: Mutex<HashMap<String, usize>>,
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
    fail_embeddings: AtomicBool,
    embed_calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `text` to `head` padded with zeros.
    pub fn pin(&self, text: &str, head: &[f32]) {
        let mut vector = vec![0.0; DIM];
        vector[..head.len()].copy_from_slice(head);
        self.pinned.lock().unwrap().insert(text.to_string(), vector);
    }

    pub fn reply(&self, text: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(text.into()));
    }

    pub fn fail_next_completion(&self, message: &str) {
        self.replies.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn set_embeddings_failing(&self, failing: bool) {
        self.fail_embeddings.store(failing, Ordering::SeqCst);
    }

    pub fn completion_calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_embeddings.load(Ordering::SeqCst) {
            return Err(anyhow!("embedding service unavailable"));
        }
        if let Some(vector) = self.pinned.lock().unwrap().get(text) {
            return Ok(vector.clone());
        }
        let mut axes = self.axes.lock().unwrap();
        let next = axes.len();
        // Axes 0..8 are reserved for pinned vectors.
        let axis = *axes.entry(text.to_string()).or_insert(8 + next);
        assert!(axis < DIM, "scripted model ran out of embedding axes");
        let mut vector = vec![0.0; DIM];
        vector[axis] = 1.0;
        Ok(vector)
    }

    async fn complete(&self, prompt: &str, _options: &CompletionOptions) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted completion left")),
        }
    }
}
