//! Batch encoding: newline-delimited JSON, gzip-compressed in memory.

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde_json::ser::Formatter;
use snafu::prelude::*;
use std::io::{self, Write};

use crate::catalog::ExecutionRecord;
use crate::error::{CompressSnafu, EncodeError, SerializationSnafu};

/// One batch, ready for upload.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    /// Gzip container holding the NDJSON text.
    pub bytes: Bytes,
    pub record_count: usize,
    /// Size of the NDJSON text before compression.
    pub uncompressed_size: usize,
}

/// Compact JSON with a single space after every `,` and `:`.
#[derive(Debug, Clone, Copy, Default)]
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        writer.write_all(b": ")
    }
}

/// Serializes records to NDJSON and compresses the result.
#[derive(Debug, Clone, Copy)]
pub struct BatchEncoder {
    compression: Compression,
}

impl Default for BatchEncoder {
    fn default() -> Self {
        Self::new(6)
    }
}

impl BatchEncoder {
    /// Create an encoder with a gzip level between 0 and 9.
    pub fn new(level: u32) -> Self {
        Self {
            compression: Compression::new(level.min(9)),
        }
    }

    /// Encode `records` as one JSON object per line, in input order.
    ///
    /// A record holding a value with no JSON representation fails the whole
    /// batch.
    pub fn encode(&self, records: &[ExecutionRecord]) -> Result<EncodedBatch, EncodeError> {
        let mut text = Vec::with_capacity(records.len() * 1024);
        for (index, record) in records.iter().enumerate() {
            let mut serializer = serde_json::Serializer::with_formatter(&mut text, SpacedFormatter);
            record
                .serialize(&mut serializer)
                .context(SerializationSnafu { index })?;
            text.push(b'\n');
        }

        let mut encoder = GzEncoder::new(Vec::with_capacity(text.len() / 4), self.compression);
        encoder.write_all(&text).context(CompressSnafu)?;
        let compressed = encoder.finish().context(CompressSnafu)?;

        Ok(EncodedBatch {
            bytes: Bytes::from(compressed),
            record_count: records.len(),
            uncompressed_size: text.len(),
        })
    }
}
