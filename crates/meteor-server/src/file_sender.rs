//! Chunked result sender.
//!
//! Sends the negotiated layout as a REQUEST_RESULT reply, then the blocks
//! in order, all under the request's correlation id. Runs on its own
//! thread so a large file never stalls the dispatcher.

use std::io::Read;
use std::thread::{self, JoinHandle};

use meteor_protocol::{BlockPlan, Envelope, ErrorCode, RequestCode};
use tracing::{debug, error, trace};

use crate::error::Result;
use crate::filesystem::ByteStream;
use crate::session::Replier;

/// An accepted result request, ready to stream.
#[derive(Debug)]
pub struct Transfer {
    pub client_id: String,
    pub job_id: String,
    pub file_index: usize,
    pub plan: BlockPlan,
    pub stream: ByteStream,
}

impl Transfer {
    /// Reply announcing the negotiated block size and count.
    pub fn spec_reply(&self) -> Envelope {
        let mut reply = Envelope::new(RequestCode::RequestResult);
        reply.client_id = Some(self.client_id.clone());
        reply.job_id = Some(self.job_id.clone());
        reply.file_index = Some(self.file_index as i64);
        reply.desired_block_size = Some(self.plan.block_size as i64);
        reply.maximum_number_of_blocks = Some(self.plan.total_blocks as i64);
        reply
    }
}

/// Stream a transfer on the calling thread; returns the number of blocks sent.
///
/// A read failure mid-stream is reported to the client as an ERROR reply,
/// which ends its consumer.
pub fn send(replier: &Replier, mut transfer: Transfer) -> Result<u64> {
    replier.reply(&transfer.spec_reply())?;

    let total = transfer.plan.total_blocks;
    for index in 0..total {
        let range = transfer.plan.block_range(index);
        let mut block = vec![0u8; (range.end - range.start) as usize];
        if let Err(e) = transfer.stream.reader.read_exact(&mut block) {
            error!(
                client_id = %transfer.client_id,
                job_id = %transfer.job_id,
                block = index,
                error = %e,
                "result read failed"
            );
            let failure = Envelope::error_reply(
                Some(&transfer.client_id),
                Some(&transfer.job_id),
                ErrorCode::SourceUnavailable,
                format!("reading block {} failed: {}", index, e),
            );
            replier.reply(&failure)?;
            return Ok(index);
        }
        trace!(job_id = %transfer.job_id, block = index, bytes = block.len(), "block sent");
        replier.send_block(block, index, total)?;
    }

    debug!(
        client_id = %transfer.client_id,
        job_id = %transfer.job_id,
        file_index = transfer.file_index,
        blocks = total,
        "transfer complete"
    );
    Ok(total)
}

/// Stream a transfer on a new thread.
pub fn spawn(replier: Replier, transfer: Transfer) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("meteor-send-{}", transfer.job_id))
        .spawn(move || {
            if let Err(e) = send(&replier, transfer) {
                error!(error = %e, "result transfer aborted");
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ReplyTarget, BLOCK_INDEX_HEADER};
    use meteor_bus::{AckMode, Broker, MemoryBroker, QueueOptions};
    use std::io::{self, Cursor};
    use std::sync::Arc;
    use std::time::Duration;

    fn replier(broker: &MemoryBroker) -> (Replier, String) {
        let q = broker.declare_queue(QueueOptions::anonymous()).unwrap();
        let target = ReplyTarget {
            reply_to: q.clone(),
            correlation_id: Some("corr".into()),
            encoding: "UTF-8".into(),
        };
        (Replier::new(Arc::new(broker.clone()), target), q)
    }

    fn transfer(content: Vec<u8>, block_size: i64, max_blocks: i64) -> Transfer {
        let len = content.len() as u64;
        Transfer {
            client_id: "c1".into(),
            job_id: "j1".into(),
            file_index: 0,
            plan: BlockPlan::negotiate(len, block_size, max_blocks, u64::MAX).unwrap(),
            stream: ByteStream {
                len,
                reader: Box::new(Cursor::new(content)),
            },
        }
    }

    #[test]
    fn test_spec_reply_then_blocks() {
        let broker = MemoryBroker::new();
        let (replier, q) = replier(&broker);
        let content: Vec<u8> = (0..1050u32).map(|i| (i % 251) as u8).collect();

        let sent = send(&replier, transfer(content.clone(), 500, 100)).unwrap();
        assert_eq!(sent, 2);

        let first = broker.receive(&q, Duration::ZERO, AckMode::Auto).unwrap().unwrap();
        let spec = Envelope::parse(&first.body).unwrap();
        assert_eq!(spec.request_code, RequestCode::RequestResult);
        assert_eq!(spec.desired_block_size, Some(500));
        assert_eq!(spec.maximum_number_of_blocks, Some(2));

        let mut reassembled = Vec::new();
        for expected in 0..2 {
            let d = broker.receive(&q, Duration::ZERO, AckMode::Auto).unwrap().unwrap();
            assert_eq!(d.correlation_id(), Some("corr"));
            assert_eq!(d.header(BLOCK_INDEX_HEADER), Some(expected.to_string().as_str()));
            reassembled.extend(d.body);
        }
        assert_eq!(reassembled, content);
        assert_eq!(broker.queue_len(&q), Some(0));
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk gone"))
        }
    }

    #[test]
    fn test_read_failure_sends_error() {
        let broker = MemoryBroker::new();
        let (replier, q) = replier(&broker);
        let mut t = transfer(vec![1, 2, 3], 1, 10);
        t.stream.reader = Box::new(FailingReader);

        assert_eq!(send(&replier, t).unwrap(), 0);
        let _spec = broker.receive(&q, Duration::ZERO, AckMode::Auto).unwrap().unwrap();
        let err = broker.receive(&q, Duration::ZERO, AckMode::Auto).unwrap().unwrap();
        let env = Envelope::parse(&err.body).unwrap();
        assert_eq!(env.error_code, Some(ErrorCode::SourceUnavailable));
    }
}
