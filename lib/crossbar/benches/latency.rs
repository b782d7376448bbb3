use criterion::{criterion_group, criterion_main, Criterion};
use crossbar::mailbox::MSG_SIZE;
use crossbar::noc::{EndpointPath, NodeId};
use crossbar::rmem::protocol::BLOCK_SIZE;
use crossbar::transport::{Direction, Loopback, Transport};
use std::sync::Arc;

fn bench_mailbox(c: &mut Criterion) {
    let fabric = Arc::new(Loopback::new());
    let receiver = fabric.attach(NodeId::new(2).unwrap());
    let sender = fabric.attach(NodeId::new(3).unwrap());

    let rx = receiver
        .open(EndpointPath::mailbox(NodeId::new(2).unwrap()), Direction::Rx)
        .unwrap();
    let tx = sender
        .open(EndpointPath::mailbox(NodeId::new(2).unwrap()), Direction::Tx)
        .unwrap();

    let frame = [0u8; MSG_SIZE];
    let mut buf = [0u8; MSG_SIZE];

    c.bench_function("mailbox_roundtrip", |b| {
        b.iter(|| {
            sender.write(tx, &frame).unwrap();
            receiver.read(rx, &mut buf).unwrap();
        })
    });
}

fn bench_portal(c: &mut Criterion) {
    let fabric = Arc::new(Loopback::new());
    let receiver = fabric.attach(NodeId::new(2).unwrap());
    let sender = fabric.attach(NodeId::new(3).unwrap());

    let rx = receiver
        .open(EndpointPath::portal(NodeId::new(2).unwrap()), Direction::Rx)
        .unwrap();
    let tx = sender
        .open(EndpointPath::portal(NodeId::new(2).unwrap()), Direction::Tx)
        .unwrap();

    let payload = vec![0u8; BLOCK_SIZE];
    let mut buf = vec![0u8; BLOCK_SIZE];

    c.bench_function("portal_block_transfer", |b| {
        b.iter(|| {
            let op = receiver.async_read_begin(rx, BLOCK_SIZE, 1).unwrap();
            sender.write(tx, &payload).unwrap();
            receiver.async_read_wait(op, &mut buf).unwrap();
        })
    });
}

criterion_group!(benches, bench_mailbox, bench_portal);
criterion_main!(benches);
