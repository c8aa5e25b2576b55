//! End-to-end slice of the pipeline: bytes fed into the stream buffer come
//! out of the output engine in the same order, through the real decode
//! loop running on its blocking thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqbaudio::output::output_fill;
use sqbaudio::pipeline::{DecodePhase, OutputPhase, Pipeline, StreamPhase};
use sqbaudio::{codec_open, spawn_decode_loop, PlayerConfig};
use sqbbuffer::RingBuffer;

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "pipeline made no progress");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thru_pipeline_preserves_byte_order() {
    let config = PlayerConfig {
        mode: "thru".to_string(),
        ..PlayerConfig::default()
    };
    let pipe = Arc::new(Pipeline::new(config, true));
    let decode_loop = spawn_decode_loop(Arc::clone(&pipe));

    assert!(codec_open(&pipe, '*', 16, 44100, 2, false));
    {
        let mut zone = pipe.output.lock().unwrap();
        zone.output.state = OutputPhase::Running;
        zone.buf.resize(1024 * 1024);
    }
    pipe.decode.lock().unwrap().ctrl.phase = DecodePhase::Running;

    // simulate the streamer: one buffered body, then remote end-of-stream
    let payload: Vec<u8> = (0..100_000usize).map(|i| (i % 251) as u8).collect();
    {
        let mut zone = pipe.stream.lock().unwrap();
        zone.state.phase = StreamPhase::StreamingHttp;
        assert_eq!(zone.buf.write_from(&payload), payload.len());
        zone.state.bytes = payload.len() as u64;
    }

    // the decode loop moves the bulk across; the sub-min_read tail stays
    // until end-of-stream arrives
    {
        let pipe = Arc::clone(&pipe);
        wait_until(move || pipe.stream.lock().unwrap().buf.used() <= 4096).await;
    }
    {
        let mut zone = pipe.stream.lock().unwrap();
        zone.state.phase = StreamPhase::Disconnect;
    }
    {
        let pipe = Arc::clone(&pipe);
        wait_until(move || pipe.decode.lock().unwrap().ctrl.phase == DecodePhase::Complete).await;
    }

    // drive the output engine the way an HTTP worker would
    let config = pipe.config.clone();
    let mut obuf = RingBuffer::new(128 * 1024);
    let mut collected = Vec::with_capacity(payload.len());
    loop {
        let more = {
            let mut zone = pipe.output.lock().unwrap();
            output_fill(&mut zone, &mut obuf, &config)
        };
        let mut chunk = vec![0u8; obuf.used()];
        obuf.read_into(&mut chunk);
        collected.extend_from_slice(&chunk);
        if !more && collected.len() >= payload.len() {
            break;
        }
        assert!(
            more || !chunk.is_empty() || collected.len() >= payload.len(),
            "output engine stalled at {} of {}",
            collected.len(),
            payload.len()
        );
    }

    assert_eq!(collected, payload, "byte order must be preserved end to end");

    pipe.stop();
    let _ = decode_loop.await;
}
