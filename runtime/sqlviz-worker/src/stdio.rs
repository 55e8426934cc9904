//! Framed request loop over a byte stream pair (stdin/stdout in the binary).

use crate::codec::{WireCodec, decode_request, encode_outbound};
use crate::config::WorkerConfig;
use crate::frame::{read_frame, write_frame};
use crate::mailbox::{queue_full, spawn_mailbox};
use crate::protocol::{Outbound, Reply};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::io::{self, Read, Write};
use std::sync::{Arc, OnceLock};
use std::thread;
use tracing::{debug, error, info, warn};

/// Serves requests from `reader` until end of stream, then drains the
/// mailbox and returns `writer`.
///
/// The codec of the first decoded request is used for every outbound frame.
pub fn serve<R, W>(config: &WorkerConfig, reader: &mut R, writer: W) -> io::Result<W>
where
    R: Read,
    W: Write + Send + 'static,
{
    let codec: Arc<OnceLock<WireCodec>> = Arc::new(OnceLock::new());
    let (outbound_tx, outbound_rx) = bounded::<Outbound>(config.max_queue.max(1));
    let mailbox = spawn_mailbox(config.mailbox(), outbound_tx.clone())?;
    let writer = thread::Builder::new().name("sqlviz-writer".to_string()).spawn({
        let codec = Arc::clone(&codec);
        move || write_loop(outbound_rx, codec, writer)
    })?;
    info!(max_queue = config.max_queue, chunk_size = config.chunk_size, "worker ready");

    loop {
        let frame = match read_frame(reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "unreadable frame, stopping");
                send(&outbound_tx, Outbound::Reply(Reply::error(0, err.to_string())));
                break;
            }
        };
        let (request, wire) = match decode_request(&frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(error = %err, "undecodable request");
                send(&outbound_tx, Outbound::Reply(Reply::error(0, err.to_string())));
                continue;
            }
        };
        codec.get_or_init(|| wire);
        match mailbox.try_submit(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                debug!(id = request.id, queued = mailbox.queued(), "queue full");
                send(&outbound_tx, Outbound::Reply(queue_full(request.id)));
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    mailbox.shut_down();
    drop(outbound_tx);
    writer
        .join()
        .map_err(|_| io::Error::other("writer thread panicked"))
}

fn send(outbound: &Sender<Outbound>, message: Outbound) {
    if outbound.send(message).is_err() {
        error!("writer is gone, message dropped");
    }
}

fn write_loop<W: Write>(
    outbound: Receiver<Outbound>,
    codec: Arc<OnceLock<WireCodec>>,
    mut writer: W,
) -> W {
    while let Ok(message) = outbound.recv() {
        let wire = codec.get().copied().unwrap_or(WireCodec::Json);
        let encoded = match encode_outbound(&message, wire) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(error = %err, "failed to encode message");
                continue;
            }
        };
        if let Err(err) = write_frame(&mut writer, &encoded) {
            error!(error = %err, "failed to write message");
            break;
        }
    }
    writer
}
