//! Minimal `multipart/form-data` envelope around a raw upload payload.
//!
//! Only the framing is materialised; the payload itself is streamed
//! between [`MultipartEnvelope::header`] and [`MultipartEnvelope::trailer`].

use rand::RngCore;
use std::fmt::Write as _;

#[derive(Debug, Clone)]
pub struct MultipartEnvelope {
    boundary: String,
    header: Vec<u8>,
    trailer: Vec<u8>,
}

impl MultipartEnvelope {
    /// Envelope with a random 60 hex character boundary.
    pub fn new() -> Self {
        let mut raw = [0u8; 30];
        rand::thread_rng().fill_bytes(&mut raw);
        let mut boundary = String::with_capacity(60);
        for b in raw {
            let _ = write!(boundary, "{b:02x}");
        }
        Self::with_boundary(boundary)
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        let boundary = boundary.into();
        let header = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        let trailer = format!("\r\n--{boundary}--\r\n").into_bytes();
        Self {
            boundary,
            header,
            trailer,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn trailer(&self) -> &[u8] {
        &self.trailer
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Exact request body size for a payload of `payload_bytes`.
    pub fn content_length(&self, payload_bytes: u64) -> u64 {
        self.header.len() as u64 + payload_bytes + self.trailer.len() as u64
    }
}

impl Default for MultipartEnvelope {
    fn default() -> Self {
        Self::new()
    }
}
