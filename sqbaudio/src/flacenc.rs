//! Streaming FLAC encoder over libFLAC's stream encoder.
//!
//! The write callback collects produced bytes into a pending vector the
//! output engine drains into its HTTP buffer after each interleaved block.

use std::ffi::c_void;

use tracing::{info, warn};

pub struct FlacEncoder {
    ptr: *mut libflac_sys::FLAC__StreamEncoder,
    sink: Box<Sink>,
}

// the encoder pointer is only touched from the owning output engine
unsafe impl Send for FlacEncoder {}

struct Sink {
    pending: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct FlacOptions {
    pub compression_level: u32,
    pub channels: u8,
    pub sample_size: u8,
    pub sample_rate: u32,
    pub block_size: u32,
    /// Total samples estimate for the STREAMINFO, None for flow mode.
    pub total_samples: Option<u64>,
}

impl FlacEncoder {
    pub fn new(options: FlacOptions) -> Option<Self> {
        use libflac_sys::*;

        unsafe {
            let ptr = FLAC__stream_encoder_new();
            if ptr.is_null() {
                warn!("FLAC__stream_encoder_new returned null");
                return None;
            }

            let mut sink = Box::new(Sink { pending: Vec::new() });

            let mut ok = FLAC__stream_encoder_set_verify(ptr, 0) != 0;
            ok &= FLAC__stream_encoder_set_compression_level(ptr, options.compression_level) != 0;
            ok &= FLAC__stream_encoder_set_channels(ptr, u32::from(options.channels)) != 0;
            ok &= FLAC__stream_encoder_set_bits_per_sample(ptr, u32::from(options.sample_size)) != 0;
            ok &= FLAC__stream_encoder_set_sample_rate(ptr, options.sample_rate) != 0;
            ok &= FLAC__stream_encoder_set_blocksize(ptr, options.block_size) != 0;
            ok &= FLAC__stream_encoder_set_streamable_subset(ptr, 0) != 0;
            if let Some(total) = options.total_samples {
                ok &= FLAC__stream_encoder_set_total_samples_estimate(ptr, total) != 0;
            }

            if ok {
                let status = FLAC__stream_encoder_init_stream(
                    ptr,
                    Some(write_callback),
                    None,
                    None,
                    None,
                    sink.as_mut() as *mut Sink as *mut c_void,
                );
                ok = status == FLAC__STREAM_ENCODER_INIT_STATUS_OK;
            }

            if !ok {
                FLAC__stream_encoder_delete(ptr);
                warn!(
                    "failed initializing flac-{} r:{} s:{} c:{}",
                    options.compression_level,
                    options.sample_rate,
                    options.sample_size,
                    options.channels
                );
                return None;
            }

            info!(
                "FLAC-{} encoding r:{} s:{}",
                options.compression_level, options.sample_rate, options.sample_size
            );
            Some(Self { ptr, sink })
        }
    }

    /// Feeds interleaved samples (right-justified at the configured sample
    /// size). Returns false on encoder failure.
    pub fn process_interleaved(&mut self, samples: &[i32], frames: u32) -> bool {
        unsafe {
            libflac_sys::FLAC__stream_encoder_process_interleaved(
                self.ptr,
                samples.as_ptr(),
                frames,
            ) != 0
        }
    }

    /// Final encode call flushing the last frame.
    pub fn finish(&mut self) {
        unsafe {
            libflac_sys::FLAC__stream_encoder_finish(self.ptr);
        }
    }

    /// Drains bytes produced since the last call.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.sink.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.sink.pending.len()
    }
}

impl Drop for FlacEncoder {
    fn drop(&mut self) {
        unsafe {
            libflac_sys::FLAC__stream_encoder_delete(self.ptr);
        }
    }
}

unsafe extern "C" fn write_callback(
    _encoder: *const libflac_sys::FLAC__StreamEncoder,
    buffer: *const libflac_sys::FLAC__byte,
    bytes: usize,
    _samples: u32,
    _current_frame: u32,
    client_data: *mut c_void,
) -> libflac_sys::FLAC__StreamEncoderWriteStatus {
    let sink = &mut *(client_data as *mut Sink);
    sink.pending
        .extend_from_slice(std::slice::from_raw_parts(buffer, bytes));
    libflac_sys::FLAC__STREAM_ENCODER_WRITE_STATUS_OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_silence_with_magic() {
        let mut enc = FlacEncoder::new(FlacOptions {
            compression_level: 0,
            channels: 2,
            sample_size: 16,
            sample_rate: 44100,
            block_size: 1024,
            total_samples: Some(1024),
        })
        .expect("encoder init");

        let silence = vec![0i32; 1024 * 2];
        assert!(enc.process_interleaved(&silence, 1024));
        enc.finish();
        let bytes = enc.take_pending();
        assert!(bytes.len() > 4);
        assert_eq!(&bytes[0..4], b"fLaC");
    }
}
