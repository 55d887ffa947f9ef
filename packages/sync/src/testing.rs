//! In-memory [`StorageGateway`] that records every call.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use supersync_gateway::{CompletedPartTag, CopySource, GatewayError, PartTarget, StorageGateway};

#[derive(Default)]
struct Upload {
    /// Part number to part length.
    parts: BTreeMap<u32, u64>,
}

#[derive(Default)]
struct State {
    requests: usize,
    next_upload: u32,
    next_version: u32,
    uploads: HashMap<String, Upload>,
    first_parts: HashMap<(String, String), u64>,
    uploaded: Vec<u32>,
    copied: Vec<(u32, CopySource)>,
    completions: Vec<Vec<u32>>,
    aborted: Vec<String>,
}

#[derive(Default)]
pub struct RecordingGateway {
    state: Mutex<State>,
    fail_upload_of: Option<u32>,
    unversioned: bool,
}

impl RecordingGateway {
    pub fn failing_upload_of(part_number: u32) -> Self {
        Self {
            fail_upload_of: Some(part_number),
            ..Self::default()
        }
    }

    pub fn unversioned() -> Self {
        Self {
            unversioned: true,
            ..Self::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.requests += 1;
        state
    }

    fn peek(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn requests(&self) -> usize {
        self.peek().requests
    }

    pub fn uploaded(&self) -> Vec<u32> {
        let mut parts = self.peek().uploaded.clone();
        parts.sort_unstable();
        parts
    }

    pub fn copied(&self) -> Vec<(u32, CopySource)> {
        let mut parts = self.peek().copied.clone();
        parts.sort_by_key(|(n, _)| *n);
        parts
    }

    pub fn completions(&self) -> Vec<Vec<u32>> {
        self.peek().completions.clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.peek().aborted.clone()
    }
}

#[async_trait]
impl StorageGateway for RecordingGateway {
    async fn start_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
    ) -> Result<String, GatewayError> {
        let mut state = self.state();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(upload_id.clone(), Upload::default());
        Ok(upload_id)
    }

    async fn upload_part(&self, target: &PartTarget, body: Vec<u8>) -> Result<String, GatewayError> {
        if self.fail_upload_of == Some(target.part_number) {
            return Err(GatewayError::UploadPart {
                bucket: target.bucket.clone(),
                key: target.key.clone(),
                part_number: target.part_number,
                source: "injected failure".into(),
            });
        }

        let mut state = self.state();
        state
            .uploads
            .entry(target.upload_id.clone())
            .or_default()
            .parts
            .insert(target.part_number, body.len() as u64);
        state.uploaded.push(target.part_number);
        Ok(format!("\"upload-{}\"", target.part_number))
    }

    async fn copy_part(
        &self,
        target: &PartTarget,
        source: &CopySource,
    ) -> Result<String, GatewayError> {
        let mut state = self.state();
        state
            .uploads
            .entry(target.upload_id.clone())
            .or_default()
            .parts
            .insert(target.part_number, source.range.len());
        state.copied.push((target.part_number, source.clone()));
        Ok(format!("\"copy-{}\"", target.part_number))
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartTag],
    ) -> Result<String, GatewayError> {
        let mut state = self.state();
        state
            .completions
            .push(parts.iter().map(|p| p.part_number).collect());

        if self.unversioned {
            return Err(GatewayError::Unversioned {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let first_part = state
            .uploads
            .remove(upload_id)
            .and_then(|u| u.parts.get(&1).copied())
            .unwrap_or(0);
        state
            .first_parts
            .insert((bucket.to_string(), key.to_string()), first_part);
        state.next_version += 1;
        Ok(format!("v{}", state.next_version))
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), GatewayError> {
        let mut state = self.state();
        state.uploads.remove(upload_id);
        state.aborted.push(upload_id.to_string());
        Ok(())
    }

    async fn head_first_part(&self, bucket: &str, key: &str) -> Result<Option<u64>, GatewayError> {
        Ok(self
            .state()
            .first_parts
            .get(&(bucket.to_string(), key.to_string()))
            .copied())
    }
}
