//! In-process simulated NoC fabric.
//!
//! Channels are keyed by `(node, tag)` and behave per tag family: mailbox
//! channels queue whole frames, portal channels queue byte chunks gathered
//! by triggered receives, and sync / portal-ack channels accumulate bits
//! into a 64-bit rendezvous register. Every runtime attaches a [`NodePort`]
//! bound to its node; the port implements [`Transport`].

use crate::noc::{EndpointPath, NodeId, TagFamily};
use crate::shared::{IpcError, IpcResult};
use crate::transport::{
    AsyncRead, Direction, EndpointId, ReadCompletion, Stat, Transport,
};
use byteorder::{ByteOrder, LittleEndian};
use girder::logging;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

/// Size of a rendezvous word on the wire.
const WORD_SIZE: usize = 8;

struct Chunk {
    from: NodeId,
    data: Vec<u8>,
}

#[derive(Default)]
struct Channel {
    rx_node: Option<NodeId>,
    rx_handles: usize,
    queue: VecDeque<Chunk>,
    queued_bytes: usize,
    word: u64,
    armed: Option<u64>,
    pending: bool,
}

struct Endpoint {
    path: EndpointPath,
    dir: Direction,
    node: NodeId,
    ranks: Option<Vec<EndpointPath>>,
    volume: u64,
    latency_ns: u64,
}

#[derive(Default)]
struct FabricState {
    channels: HashMap<EndpointPath, Channel>,
    endpoints: HashMap<EndpointId, Endpoint>,
    next_endpoint: EndpointId,
}

/// The shared fabric. One instance stands in for the physical NoC.
pub struct Loopback {
    state: Mutex<FabricState>,
    cvar: Condvar,
    log: logging::Logger,
}

impl Loopback {
    pub fn new() -> Loopback {
        Self::with_log(None)
    }

    pub fn with_log<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Loopback {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Loopback {
            state: Mutex::new(FabricState::default()),
            cvar: Condvar::new(),
            log,
        }
    }

    /// Attaches a node to the fabric, yielding its transport port.
    pub fn attach(self: &Arc<Self>, node: NodeId) -> NodePort {
        NodePort {
            fabric: self.clone(),
            node,
        }
    }

    fn lock(&self) -> MutexGuard<FabricState> {
        self.state.lock().expect("fabric lock poisoned")
    }

    fn open(&self, node: NodeId, path: EndpointPath, dir: Direction) -> IpcResult<EndpointId> {
        let mut st = self.lock();

        let channel = st.channels.entry(path).or_default();

        if dir == Direction::Rx {
            match channel.rx_node {
                Some(owner) if owner != node => return Err(IpcError::Again),
                _ => {
                    channel.rx_node = Some(node);
                    channel.rx_handles += 1;
                }
            }
        }

        let id = st.next_endpoint;
        st.next_endpoint += 1;
        st.endpoints.insert(
            id,
            Endpoint {
                path,
                dir,
                node,
                ranks: None,
                volume: 0,
                latency_ns: 0,
            },
        );

        logging::trace!(self.log, "endpoint opened";
                        "path" => %path, "dir" => ?dir, "node" => %node, "endpoint" => id);

        Ok(id)
    }

    fn close(&self, endpoint: EndpointId) -> IpcResult<()> {
        let mut st = self.lock();

        let info = st.endpoints.remove(&endpoint).ok_or(IpcError::Inval)?;

        if info.dir == Direction::Rx {
            let channel = st
                .channels
                .get_mut(&info.path)
                .expect("rx endpoint without channel");

            channel.rx_handles -= 1;

            if channel.rx_handles == 0 {
                channel.rx_node = None;
                channel.queue.clear();
                channel.queued_bytes = 0;
                channel.word = 0;
                channel.armed = None;
                channel.pending = false;
            }
        }

        logging::trace!(self.log, "endpoint closed"; "path" => %info.path, "endpoint" => endpoint);

        self.cvar.notify_all();

        Ok(())
    }

    fn write(&self, endpoint: EndpointId, buf: &[u8]) -> IpcResult<usize> {
        let mut st = self.lock();

        let (path, node, ranks) = {
            let info = st.endpoints.get(&endpoint).ok_or(IpcError::Inval)?;

            if info.dir != Direction::Tx {
                return Err(IpcError::NotSup);
            }

            (info.path, info.node, info.ranks.clone())
        };

        match path.family() {
            TagFamily::Mailbox | TagFamily::Portal => {
                assert!(!buf.is_empty(), "zero-length transfer");

                let channel = st.channels.entry(path).or_default();
                channel.queued_bytes += buf.len();
                channel.queue.push_back(Chunk {
                    from: node,
                    data: buf.to_vec(),
                });
            }
            TagFamily::Sync | TagFamily::PortalAck => {
                assert_eq!(buf.len(), WORD_SIZE, "rendezvous write must be one word");

                let word = LittleEndian::read_u64(buf);
                let targets = ranks.unwrap_or_else(|| vec![path]);

                for target in targets {
                    st.channels.entry(target).or_default().word |= word;
                }
            }
            TagFamily::Reserved => return Err(IpcError::Inval),
        }

        if let Some(info) = st.endpoints.get_mut(&endpoint) {
            info.volume += buf.len() as u64;
        }

        self.cvar.notify_all();

        Ok(buf.len())
    }

    fn read(&self, endpoint: EndpointId, buf: &mut [u8]) -> IpcResult<usize> {
        let family = {
            let st = self.lock();
            let info = st.endpoints.get(&endpoint).ok_or(IpcError::Inval)?;

            if info.dir != Direction::Rx {
                return Err(IpcError::NotSup);
            }

            info.path.family()
        };

        match family {
            TagFamily::Mailbox => self.read_frame(endpoint, buf),
            TagFamily::Portal => {
                let op = self.async_read_begin(endpoint, buf.len(), 1)?;
                self.async_read_wait(op, buf).map(|completion| completion.len)
            }
            TagFamily::Sync | TagFamily::PortalAck => self.read_word(endpoint, buf),
            TagFamily::Reserved => Err(IpcError::Inval),
        }
    }

    /// Pops exactly one queued frame off a mailbox channel.
    fn read_frame(&self, endpoint: EndpointId, buf: &mut [u8]) -> IpcResult<usize> {
        let started = Instant::now();
        let mut st = self.lock();
        let path = st.endpoints[&endpoint].path;

        loop {
            let channel = st.channels.entry(path).or_default();

            if let Some(chunk) = channel.queue.pop_front() {
                assert_eq!(chunk.data.len(), buf.len(), "mailbox frame size mismatch");

                channel.queued_bytes -= chunk.data.len();
                buf.copy_from_slice(&chunk.data);

                self.account(&mut st, endpoint, buf.len(), started);
                self.cvar.notify_all();

                return Ok(buf.len());
            }

            st = self.cvar.wait(st).expect("fabric lock poisoned");
        }
    }

    /// Blocks until the armed rendezvous register reaches all-ones and
    /// delivers the accumulated bits.
    fn read_word(&self, endpoint: EndpointId, buf: &mut [u8]) -> IpcResult<usize> {
        assert!(buf.len() >= WORD_SIZE, "rendezvous read needs a word buffer");

        let started = Instant::now();
        let mut st = self.lock();
        let path = st.endpoints[&endpoint].path;

        loop {
            let channel = st.channels.entry(path).or_default();

            if let Some(init) = channel.armed {
                if (init | channel.word) == u64::max_value() {
                    let received = channel.word;

                    channel.word = 0;
                    channel.armed = None;

                    LittleEndian::write_u64(&mut buf[..WORD_SIZE], received);

                    self.account(&mut st, endpoint, WORD_SIZE, started);
                    self.cvar.notify_all();

                    return Ok(WORD_SIZE);
                }
            }

            st = self.cvar.wait(st).expect("fabric lock poisoned");
        }
    }

    fn set_rx_match(&self, endpoint: EndpointId, mask: u64) -> IpcResult<()> {
        let mut st = self.lock();

        let path = {
            let info = st.endpoints.get(&endpoint).ok_or(IpcError::Inval)?;

            if info.dir != Direction::Rx {
                return Err(IpcError::NotSup);
            }

            match info.path.family() {
                TagFamily::Sync | TagFamily::PortalAck => info.path,
                _ => return Err(IpcError::NotSup),
            }
        };

        st.channels.entry(path).or_default().armed = Some(mask);
        self.cvar.notify_all();

        Ok(())
    }

    fn set_rx_ranks(&self, endpoint: EndpointId, ranks: &[EndpointPath]) -> IpcResult<()> {
        let mut st = self.lock();

        let info = st.endpoints.get_mut(&endpoint).ok_or(IpcError::Inval)?;

        if info.dir != Direction::Tx {
            return Err(IpcError::NotSup);
        }

        info.ranks = Some(ranks.to_vec());

        Ok(())
    }

    fn async_read_begin(
        &self,
        endpoint: EndpointId,
        len: usize,
        trigger: u32,
    ) -> IpcResult<AsyncRead> {
        if len == 0 || trigger == 0 {
            return Err(IpcError::Inval);
        }

        let mut st = self.lock();

        let path = {
            let info = st.endpoints.get(&endpoint).ok_or(IpcError::Inval)?;

            if info.dir != Direction::Rx || info.path.family() != TagFamily::Portal {
                return Err(IpcError::NotSup);
            }

            info.path
        };

        let channel = st.channels.entry(path).or_default();

        // One receive may be outstanding per channel.
        if channel.pending {
            return Err(IpcError::Again);
        }

        channel.pending = true;

        Ok(AsyncRead {
            endpoint,
            len,
            trigger,
        })
    }

    fn async_read_wait(&self, op: AsyncRead, buf: &mut [u8]) -> IpcResult<ReadCompletion> {
        assert_eq!(buf.len(), op.len, "completion buffer size mismatch");

        let started = Instant::now();
        let mut st = self.lock();
        let path = st.endpoints[&op.endpoint].path;

        loop {
            {
                let channel = st.channels.entry(path).or_default();

                if channel.queue.len() >= op.trigger as usize && channel.queued_bytes >= op.len {
                    let mut filled = 0;
                    let mut from = None;

                    while filled < op.len {
                        let chunk = channel.queue.pop_front().expect("gather underrun");

                        assert!(
                            filled + chunk.data.len() <= op.len,
                            "portal transfer framing mismatch"
                        );

                        buf[filled..filled + chunk.data.len()].copy_from_slice(&chunk.data);
                        filled += chunk.data.len();
                        channel.queued_bytes -= chunk.data.len();
                        from.get_or_insert(chunk.from);
                    }

                    channel.pending = false;

                    let from = from.expect("gather without producer");

                    self.account(&mut st, op.endpoint, op.len, started);
                    self.cvar.notify_all();

                    return Ok(ReadCompletion { len: op.len, from });
                }
            }

            st = self.cvar.wait(st).expect("fabric lock poisoned");
        }
    }

    fn stats(&self, endpoint: EndpointId, stat: Stat) -> IpcResult<u64> {
        let st = self.lock();
        let info = st.endpoints.get(&endpoint).ok_or(IpcError::Inval)?;

        Ok(girder::choose!(stat == Stat::Volume => info.volume, info.latency_ns))
    }

    fn account(&self, st: &mut FabricState, endpoint: EndpointId, len: usize, started: Instant) {
        if let Some(info) = st.endpoints.get_mut(&endpoint) {
            info.volume += len as u64;
            info.latency_ns += started.elapsed().as_nanos() as u64;
        }
    }
}

/// A node's view of the fabric.
pub struct NodePort {
    fabric: Arc<Loopback>,
    node: NodeId,
}

impl NodePort {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl Transport for NodePort {
    fn open(&self, path: EndpointPath, dir: Direction) -> IpcResult<EndpointId> {
        self.fabric.open(self.node, path, dir)
    }

    fn close(&self, endpoint: EndpointId) -> IpcResult<()> {
        self.fabric.close(endpoint)
    }

    fn read(&self, endpoint: EndpointId, buf: &mut [u8]) -> IpcResult<usize> {
        self.fabric.read(endpoint, buf)
    }

    fn write(&self, endpoint: EndpointId, buf: &[u8]) -> IpcResult<usize> {
        self.fabric.write(endpoint, buf)
    }

    fn set_rx_match(&self, endpoint: EndpointId, mask: u64) -> IpcResult<()> {
        self.fabric.set_rx_match(endpoint, mask)
    }

    fn set_rx_ranks(&self, endpoint: EndpointId, ranks: &[EndpointPath]) -> IpcResult<()> {
        self.fabric.set_rx_ranks(endpoint, ranks)
    }

    fn async_read_begin(
        &self,
        endpoint: EndpointId,
        len: usize,
        trigger: u32,
    ) -> IpcResult<AsyncRead> {
        self.fabric.async_read_begin(endpoint, len, trigger)
    }

    fn async_read_wait(&self, op: AsyncRead, buf: &mut [u8]) -> IpcResult<ReadCompletion> {
        self.fabric.async_read_wait(op, buf)
    }

    fn stats(&self, endpoint: EndpointId, stat: Stat) -> IpcResult<u64> {
        self.fabric.stats(endpoint, stat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn fabric() -> Arc<Loopback> {
        Arc::new(Loopback::new())
    }

    fn node(raw: usize) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    #[test]
    fn test_mailbox_frames_arrive_in_order() {
        let fabric = fabric();
        let a = fabric.attach(node(2));
        let b = fabric.attach(node(3));

        let rx = a.open(EndpointPath::mailbox(node(2)), Direction::Rx).unwrap();
        let tx = b.open(EndpointPath::mailbox(node(2)), Direction::Tx).unwrap();

        b.write(tx, &[1u8; 16]).unwrap();
        b.write(tx, &[2u8; 16]).unwrap();

        let mut buf = [0u8; 16];
        a.read(rx, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 16]);
        a.read(rx, &mut buf).unwrap();
        assert_eq!(buf, [2u8; 16]);
    }

    #[test]
    fn test_mailbox_read_blocks_until_write() {
        let fabric = fabric();
        let a = fabric.attach(node(2));
        let b = fabric.attach(node(3));

        let rx = a.open(EndpointPath::mailbox(node(2)), Direction::Rx).unwrap();

        let writer = thread::spawn(move || {
            let tx = b.open(EndpointPath::mailbox(node(2)), Direction::Tx).unwrap();
            b.write(tx, &[7u8; 8]).unwrap();
        });

        let mut buf = [0u8; 8];
        a.read(rx, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 8]);

        writer.join().unwrap();
    }

    #[test]
    fn test_rx_side_is_exclusive_per_node() {
        let fabric = fabric();
        let a = fabric.attach(node(2));
        let b = fabric.attach(node(3));

        let first = a.open(EndpointPath::mailbox(node(2)), Direction::Rx).unwrap();

        // A second handle from the owning node is fine.
        let second = a.open(EndpointPath::mailbox(node(2)), Direction::Rx).unwrap();

        // Another node cannot claim the receive side.
        assert_eq!(
            b.open(EndpointPath::mailbox(node(2)), Direction::Rx).unwrap_err(),
            IpcError::Again
        );

        a.close(first).unwrap();
        a.close(second).unwrap();

        // Fully released, the channel can change owners.
        b.open(EndpointPath::mailbox(node(2)), Direction::Rx).unwrap();
    }

    #[test]
    fn test_sync_word_accumulates_until_match() {
        let fabric = fabric();
        let receiver = fabric.attach(node(4));
        let s1 = fabric.attach(node(5));
        let s2 = fabric.attach(node(6));

        let rx = receiver
            .open(EndpointPath::sync(node(4)), Direction::Rx)
            .unwrap();

        let wanted: u64 = (1 << 1) | (1 << 2);
        receiver.set_rx_match(rx, !wanted).unwrap();

        let mut word = [0u8; 8];
        LittleEndian::write_u64(&mut word, 1 << 1);
        let tx1 = s1.open(EndpointPath::sync(node(4)), Direction::Tx).unwrap();
        s1.write(tx1, &word).unwrap();

        let handle = thread::spawn(move || {
            let tx2 = s2.open(EndpointPath::sync(node(4)), Direction::Tx).unwrap();
            let mut word = [0u8; 8];
            LittleEndian::write_u64(&mut word, 1 << 2);
            s2.write(tx2, &word).unwrap();
        });

        let mut buf = [0u8; 8];
        receiver.read(rx, &mut buf).unwrap();
        assert_eq!(LittleEndian::read_u64(&buf), wanted);

        handle.join().unwrap();
    }

    #[test]
    fn test_ranks_broadcast_one_write() {
        let fabric = fabric();
        let leader = fabric.attach(node(2));
        let w1 = fabric.attach(node(3));
        let w2 = fabric.attach(node(4));

        let rx1 = w1.open(EndpointPath::sync(node(3)), Direction::Rx).unwrap();
        let rx2 = w2.open(EndpointPath::sync(node(4)), Direction::Rx).unwrap();
        w1.set_rx_match(rx1, !1u64).unwrap();
        w2.set_rx_match(rx2, !1u64).unwrap();

        let tx = leader
            .open(EndpointPath::sync(node(3)), Direction::Tx)
            .unwrap();
        leader
            .set_rx_ranks(tx, &[EndpointPath::sync(node(3)), EndpointPath::sync(node(4))])
            .unwrap();

        let mut word = [0u8; 8];
        LittleEndian::write_u64(&mut word, 1);
        leader.write(tx, &word).unwrap();

        let mut buf = [0u8; 8];
        w1.read(rx1, &mut buf).unwrap();
        assert_eq!(LittleEndian::read_u64(&buf), 1);
        w2.read(rx2, &mut buf).unwrap();
        assert_eq!(LittleEndian::read_u64(&buf), 1);
    }

    #[test]
    fn test_triggered_receive_gathers_chunks() {
        let fabric = fabric();
        let receiver = fabric.attach(node(2));
        let sender = fabric.attach(node(3));

        let rx = receiver
            .open(EndpointPath::portal(node(2)), Direction::Rx)
            .unwrap();
        let tx = sender
            .open(EndpointPath::portal(node(2)), Direction::Tx)
            .unwrap();

        let op = receiver.async_read_begin(rx, 128, 2).unwrap();

        sender.write(tx, &[1u8; 64]).unwrap();
        sender.write(tx, &[2u8; 64]).unwrap();

        let mut buf = [0u8; 128];
        let completion = receiver.async_read_wait(op, &mut buf).unwrap();

        assert_eq!(completion.len, 128);
        assert_eq!(completion.from, node(3));
        assert_eq!(&buf[..64], &[1u8; 64][..]);
        assert_eq!(&buf[64..], &[2u8; 64][..]);
    }

    #[test]
    fn test_single_pending_receive_per_channel() {
        let fabric = fabric();
        let receiver = fabric.attach(node(2));

        let rx = receiver
            .open(EndpointPath::portal(node(2)), Direction::Rx)
            .unwrap();

        let _op = receiver.async_read_begin(rx, 16, 1).unwrap();
        assert_eq!(
            receiver.async_read_begin(rx, 16, 1).unwrap_err(),
            IpcError::Again
        );
    }

    #[test]
    fn test_writes_buffer_before_receiver_opens() {
        let fabric = fabric();
        let sender = fabric.attach(node(3));

        let tx = sender
            .open(EndpointPath::mailbox(node(2)), Direction::Tx)
            .unwrap();
        sender.write(tx, &[9u8; 8]).unwrap();

        let receiver = fabric.attach(node(2));
        let rx = receiver
            .open(EndpointPath::mailbox(node(2)), Direction::Rx)
            .unwrap();

        let mut buf = [0u8; 8];
        receiver.read(rx, &mut buf).unwrap();
        assert_eq!(buf, [9u8; 8]);
    }

    #[test]
    fn test_stats_track_volume() {
        let fabric = fabric();
        let a = fabric.attach(node(2));
        let b = fabric.attach(node(3));

        let rx = a.open(EndpointPath::mailbox(node(2)), Direction::Rx).unwrap();
        let tx = b.open(EndpointPath::mailbox(node(2)), Direction::Tx).unwrap();

        b.write(tx, &[0u8; 32]).unwrap();

        let mut buf = [0u8; 32];
        a.read(rx, &mut buf).unwrap();

        assert_eq!(b.stats(tx, Stat::Volume).unwrap(), 32);
        assert_eq!(a.stats(rx, Stat::Volume).unwrap(), 32);
    }

    #[test]
    fn test_stats_track_blocked_time() {
        let fabric = fabric();
        let a = fabric.attach(node(2));
        let b = fabric.attach(node(3));

        let rx = a.open(EndpointPath::mailbox(node(2)), Direction::Rx).unwrap();

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));

            let tx = b.open(EndpointPath::mailbox(node(2)), Direction::Tx).unwrap();
            b.write(tx, &[1u8; 8]).unwrap();
        });

        let mut buf = [0u8; 8];
        a.read(rx, &mut buf).unwrap();

        // The read spent the writer's delay blocked on the endpoint.
        assert!(a.stats(rx, Stat::Latency).unwrap() > 0);

        writer.join().unwrap();
    }

    #[test]
    fn test_direction_misuse_rejected() {
        let fabric = fabric();
        let a = fabric.attach(node(2));

        let rx = a.open(EndpointPath::mailbox(node(2)), Direction::Rx).unwrap();
        let tx = a.open(EndpointPath::mailbox(node(3)), Direction::Tx).unwrap();

        assert_eq!(a.write(rx, &[0u8; 8]).unwrap_err(), IpcError::NotSup);

        let mut buf = [0u8; 8];
        assert_eq!(a.read(tx, &mut buf).unwrap_err(), IpcError::NotSup);
    }

    #[test]
    fn test_close_releases_endpoint() {
        let fabric = fabric();
        let a = fabric.attach(node(2));

        let rx = a.open(EndpointPath::mailbox(node(2)), Direction::Rx).unwrap();
        a.close(rx).unwrap();

        assert_eq!(a.close(rx).unwrap_err(), IpcError::Inval);

        let mut buf = [0u8; 8];
        assert_eq!(a.read(rx, &mut buf).unwrap_err(), IpcError::Inval);
    }
}
