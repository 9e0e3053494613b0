//! Binary layout of sample batches.
//!
//! ```text
//! batch  := [format:1][byte_order:1][reserved:2][channel_count:4 BE]
//!           [nominal_srate:8 BE][count:4 BE] sample*
//! sample := [tag:1] [timestamp:8]? value*
//! ```
//!
//! `tag` is [`TAG_DEDUCED_TIMESTAMP`] when the timestamp equals the previous
//! sample's plus `1 / nominal_srate` (the timestamp is then omitted) and
//! [`TAG_TRANSMITTED_TIMESTAMP`] otherwise.  The first sample of a batch is
//! always transmitted.
//!
//! Timestamps and values use the batch's byte order.  Numeric values take
//! the format's fixed width; strings are a 4-byte length followed by UTF-8.

use crate::domain::channel_format::ChannelFormat;
use crate::domain::sample::Sample;
use crate::domain::values::ChannelValues;
use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::{ByteOrder, SampleBatch};

/// Tag of a sample whose timestamp is reconstructed by the receiver.
pub const TAG_DEDUCED_TIMESTAMP: u8 = 1;

/// Tag of a sample carrying its own timestamp.
pub const TAG_TRANSMITTED_TIMESTAMP: u8 = 2;

const BATCH_HEADER_SIZE: usize = 20;

// ── Numbers in either byte order ──────────────────────────────────────────────

trait WireNumber: Sized + Copy {
    const WIDTH: usize;
    fn put(self, order: ByteOrder, buf: &mut Vec<u8>);
    fn get(bytes: &[u8], order: ByteOrder) -> Self;
}

macro_rules! impl_wire_number {
    ($($ty:ty),*) => {
        $(
            impl WireNumber for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn put(self, order: ByteOrder, buf: &mut Vec<u8>) {
                    match order {
                        ByteOrder::Big => buf.extend_from_slice(&self.to_be_bytes()),
                        ByteOrder::Little => buf.extend_from_slice(&self.to_le_bytes()),
                    }
                }

                fn get(bytes: &[u8], order: ByteOrder) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::WIDTH]);
                    match order {
                        ByteOrder::Big => <$ty>::from_be_bytes(raw),
                        ByteOrder::Little => <$ty>::from_le_bytes(raw),
                    }
                }
            }
        )*
    };
}

impl_wire_number!(i8, i16, i32, i64, f32, f64, u32);

fn put_all<T: WireNumber>(values: &[T], order: ByteOrder, buf: &mut Vec<u8>) {
    for &v in values {
        v.put(order, buf);
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Appends the encoded batch to `buf`.
///
/// # Errors
///
/// [`ProtocolError::MalformedPayload`] when a sample does not match the
/// batch's format or channel count, or a string is longer than 4 GiB.
pub fn encode_batch(buf: &mut Vec<u8>, batch: &SampleBatch) -> Result<(), ProtocolError> {
    let order = batch.byte_order;
    buf.push(batch.channel_format as u8);
    buf.push(order as u8);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&batch.channel_count.to_be_bytes());
    buf.extend_from_slice(&batch.nominal_srate.to_be_bytes());
    buf.extend_from_slice(&(batch.samples.len() as u32).to_be_bytes());

    let mut previous: Option<f64> = None;
    for sample in &batch.samples {
        check_sample(batch, sample)?;
        match previous {
            Some(prev)
                if batch.nominal_srate > 0.0
                    && sample.timestamp == prev + 1.0 / batch.nominal_srate =>
            {
                buf.push(TAG_DEDUCED_TIMESTAMP);
            }
            _ => {
                buf.push(TAG_TRANSMITTED_TIMESTAMP);
                sample.timestamp.put(order, buf);
            }
        }
        previous = Some(sample.timestamp);
        encode_values(buf, &sample.values, order)?;
    }
    Ok(())
}

fn check_sample(batch: &SampleBatch, sample: &Sample) -> Result<(), ProtocolError> {
    if sample.values.format() != batch.channel_format {
        return Err(ProtocolError::MalformedPayload(format!(
            "sample of format {} in a {} batch",
            sample.values.format(),
            batch.channel_format
        )));
    }
    if sample.values.len() != batch.channel_count as usize {
        return Err(ProtocolError::MalformedPayload(format!(
            "sample with {} values in a {}-channel batch",
            sample.values.len(),
            batch.channel_count
        )));
    }
    Ok(())
}

fn encode_values(
    buf: &mut Vec<u8>,
    values: &ChannelValues,
    order: ByteOrder,
) -> Result<(), ProtocolError> {
    match values {
        ChannelValues::Float32(v) => put_all(v, order, buf),
        ChannelValues::Double64(v) => put_all(v, order, buf),
        ChannelValues::Int32(v) => put_all(v, order, buf),
        ChannelValues::Int16(v) => put_all(v, order, buf),
        ChannelValues::Int8(v) => put_all(v, order, buf),
        ChannelValues::Int64(v) => put_all(v, order, buf),
        ChannelValues::String(v) => {
            for s in v {
                let len = u32::try_from(s.len()).map_err(|_| {
                    ProtocolError::MalformedPayload(format!("string of {} bytes", s.len()))
                })?;
                len.put(order, buf);
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }
    Ok(())
}

// ── Decoding ──────────────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::MalformedPayload(format!(
                "sample batch: need {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn number<T: WireNumber>(&mut self) -> Result<T, ProtocolError> {
        let order = self.order;
        self.take(T::WIDTH).map(|b| T::get(b, order))
    }

    fn numbers<T: WireNumber>(&mut self, n: usize) -> Result<Vec<T>, ProtocolError> {
        let order = self.order;
        let bytes = self.take(n.saturating_mul(T::WIDTH))?;
        Ok(bytes.chunks_exact(T::WIDTH).map(|c| T::get(c, order)).collect())
    }

    fn values(&mut self, format: ChannelFormat, n: usize) -> Result<ChannelValues, ProtocolError> {
        let values = match format {
            ChannelFormat::Float32 => ChannelValues::Float32(self.numbers(n)?),
            ChannelFormat::Double64 => ChannelValues::Double64(self.numbers(n)?),
            ChannelFormat::Int32 => ChannelValues::Int32(self.numbers(n)?),
            ChannelFormat::Int16 => ChannelValues::Int16(self.numbers(n)?),
            ChannelFormat::Int8 => ChannelValues::Int8(self.numbers(n)?),
            ChannelFormat::Int64 => ChannelValues::Int64(self.numbers(n)?),
            ChannelFormat::String => {
                let mut strings = Vec::with_capacity(n.min(self.remaining() / 4));
                for _ in 0..n {
                    let len = self.number::<u32>()? as usize;
                    let raw = self.take(len)?;
                    let s = std::str::from_utf8(raw).map_err(|e| {
                        ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}"))
                    })?;
                    strings.push(s.to_string());
                }
                ChannelValues::String(strings)
            }
            ChannelFormat::Undefined => {
                return Err(ProtocolError::MalformedPayload(
                    "sample batch of undefined format".to_string(),
                ))
            }
        };
        Ok(values)
    }
}

/// Decodes a batch; sample `i` gets sequence `first_sequence + i`.
///
/// # Errors
///
/// [`ProtocolError::MalformedPayload`] for truncated or inconsistent input.
/// Declared counts are checked against the bytes actually present before
/// anything is allocated.
pub fn decode_batch(p: &[u8], first_sequence: u64) -> Result<SampleBatch, ProtocolError> {
    if p.len() < BATCH_HEADER_SIZE {
        return Err(ProtocolError::MalformedPayload(format!(
            "sample batch: need {BATCH_HEADER_SIZE} header bytes, got {}",
            p.len()
        )));
    }
    let channel_format = ChannelFormat::try_from(p[0])
        .map_err(|b| ProtocolError::MalformedPayload(format!("unknown channel format {b}")))?;
    let byte_order = ByteOrder::try_from(p[1])
        .map_err(|b| ProtocolError::MalformedPayload(format!("unknown byte order {b}")))?;
    let channel_count = u32::from_be_bytes([p[4], p[5], p[6], p[7]]);
    let nominal_srate = f64::from_be_bytes([p[8], p[9], p[10], p[11], p[12], p[13], p[14], p[15]]);
    let count = u32::from_be_bytes([p[16], p[17], p[18], p[19]]) as usize;

    let channels = channel_count as usize;
    let min_value_width = channel_format.element_width().unwrap_or(4);
    let min_sample_size = channels.saturating_mul(min_value_width).saturating_add(1);
    if count.saturating_mul(min_sample_size) > p.len() - BATCH_HEADER_SIZE {
        return Err(ProtocolError::MalformedPayload(format!(
            "sample batch declares {count} samples of {channels} channels in {} bytes",
            p.len() - BATCH_HEADER_SIZE
        )));
    }

    let mut reader = Reader {
        buf: &p[BATCH_HEADER_SIZE..],
        pos: 0,
        order: byte_order,
    };
    let mut samples = Vec::with_capacity(count);
    let mut previous: Option<f64> = None;
    for i in 0..count {
        let tag = reader.take(1)?[0];
        let timestamp = match (tag, previous) {
            (TAG_TRANSMITTED_TIMESTAMP, _) => reader.number::<f64>()?,
            (TAG_DEDUCED_TIMESTAMP, Some(prev)) if nominal_srate > 0.0 => prev + 1.0 / nominal_srate,
            _ => {
                return Err(ProtocolError::MalformedPayload(format!(
                    "sample {i}: invalid timestamp tag {tag}"
                )))
            }
        };
        previous = Some(timestamp);
        let values = reader.values(channel_format, channels)?;
        samples.push(Sample {
            timestamp,
            values,
            pushthrough: false,
            sequence: first_sequence.wrapping_add(i as u64),
        });
    }
    if reader.remaining() != 0 {
        return Err(ProtocolError::MalformedPayload(format!(
            "sample batch: {} trailing bytes",
            reader.remaining()
        )));
    }

    Ok(SampleBatch {
        channel_format,
        byte_order,
        channel_count,
        nominal_srate,
        samples,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(format: ChannelFormat, order: ByteOrder, srate: f64, stamps: &[f64]) -> SampleBatch {
        SampleBatch {
            channel_format: format,
            byte_order: order,
            channel_count: 3,
            nominal_srate: srate,
            samples: stamps
                .iter()
                .enumerate()
                .map(|(i, &t)| Sample {
                    timestamp: t,
                    values: ChannelValues::test_pattern(format, 3, i as i64)
                        .expect("pattern"),
                    pushthrough: false,
                    sequence: 40 + i as u64,
                })
                .collect(),
        }
    }

    #[test]
    fn test_every_format_and_byte_order_decodes_to_same_batch() {
        for format in ChannelFormat::ALL {
            for order in [ByteOrder::Little, ByteOrder::Big] {
                // Arrange
                let original = batch(format, order, 0.0, &[1.5, 2.5]);
                let mut buf = Vec::new();

                // Act
                encode_batch(&mut buf, &original).expect("encode");
                let decoded = decode_batch(&buf, 40).expect("decode");

                // Assert
                assert_eq!(decoded, original, "{format} {order:?}");
            }
        }
    }

    #[test]
    fn test_regular_timestamps_are_deduced() {
        // Arrange – 100 Hz, consecutive stamps exactly 1/100 apart
        let t0 = 10.0;
        let stamps = [t0, t0 + 1.0 / 100.0, t0 + 1.0 / 100.0 + 1.0 / 100.0];
        let original = batch(ChannelFormat::Int16, ByteOrder::Little, 100.0, &stamps);
        let mut buf = Vec::new();

        // Act
        encode_batch(&mut buf, &original).expect("encode");
        let decoded = decode_batch(&buf, 40).expect("decode");

        // Assert – one transmitted stamp, two deduced, all reproduced exactly
        let per_sample = 1 + 3 * 2;
        assert_eq!(buf.len(), BATCH_HEADER_SIZE + 8 + 3 * per_sample);
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_values_use_requested_byte_order() {
        // Arrange
        let mut original = batch(ChannelFormat::Int32, ByteOrder::Big, 0.0, &[0.0]);
        original.samples[0].values = ChannelValues::Int32(vec![1, 2, 3]);
        let mut buf = Vec::new();

        // Act
        encode_batch(&mut buf, &original).expect("encode");

        // Assert – first value right after header, tag and timestamp
        let start = BATCH_HEADER_SIZE + 1 + 8;
        assert_eq!(&buf[start..start + 4], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_encode_rejects_mismatched_sample() {
        let mut original = batch(ChannelFormat::Float32, ByteOrder::Little, 0.0, &[0.0]);
        original.samples[0].values = ChannelValues::Float32(vec![1.0]);

        let result = encode_batch(&mut Vec::new(), &original);

        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_decode_rejects_truncation_and_absurd_counts() {
        // Arrange
        let original = batch(ChannelFormat::String, ByteOrder::Little, 0.0, &[1.0, 2.0]);
        let mut buf = Vec::new();
        encode_batch(&mut buf, &original).expect("encode");

        // Act / Assert – every truncation fails without panicking
        for cut in 0..buf.len() {
            assert!(decode_batch(&buf[..cut], 0).is_err(), "cut at {cut}");
        }

        // A header claiming u32::MAX samples must not allocate
        let mut absurd = buf[..BATCH_HEADER_SIZE].to_vec();
        absurd[16..20].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(decode_batch(&absurd, 0).is_err());
    }

    #[test]
    fn test_decode_rejects_deduced_first_sample() {
        // Arrange
        let original = batch(ChannelFormat::Int8, ByteOrder::Little, 10.0, &[1.0]);
        let mut buf = Vec::new();
        encode_batch(&mut buf, &original).expect("encode");
        buf[BATCH_HEADER_SIZE] = TAG_DEDUCED_TIMESTAMP;

        // Act
        let result = decode_batch(&buf, 0);

        // Assert
        assert!(result.is_err());
    }
}
