//! Benchmark: ingest path (`request_flow::drain`) without `io_uring`.

use std::hint::black_box;

use seguro::request_flow::{self, Connection};

fn feed(conn: &mut Connection, bytes: &[u8]) {
    unsafe {
        let ptr = conn.read_buf.write_ptr();
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
    }
    conn.read_buf.advance_w(bytes.len());
}

fn drain_and_commit(conn: &mut Connection) {
    let _ = request_flow::drain(conn).unwrap();
    // simulate the store worker releasing the data bytes once committed
    while conn.op_queue.dequeue().is_some() {}
    let occ = conn.read_buf.occupied();
    conn.read_buf.advance_r(occ);
}

fn main() {
    const READ_BUF_SIZE: usize = 1 << 16;
    const OP_QUEUE_CAP: usize = 64;

    let event_body = vec![0x61u8; 256];
    let write_line = |id: u64| -> Vec<u8> {
        let mut buf = format!("WRITE {id} 256\n").into_bytes();
        buf.extend_from_slice(&event_body);
        buf.extend_from_slice(b"\n\n");
        buf
    };

    let mut conn = Connection::new(1, READ_BUF_SIZE, OP_QUEUE_CAP);
    conn.client.begin_handshake();
    feed(&mut conn, b"HELLO 0\nPOINT ~zod\n");
    let _ = request_flow::drain(&mut conn).unwrap();
    conn.client.finish_handshake(0);

    let mut next_id = 1u64;
    let mut bytes_per_write = 0u64;

    // Warm up
    for _ in 0..10_000 {
        let line = write_line(next_id);
        bytes_per_write = line.len() as u64;
        next_id += 1;
        feed(&mut conn, &line);
        drain_and_commit(&mut conn);
    }

    let start = std::time::Instant::now();
    const TARGET_DURATION: std::time::Duration = std::time::Duration::from_secs(2);
    let mut iterations: u64 = 0;

    while start.elapsed() < TARGET_DURATION {
        let line = write_line(next_id);
        next_id += 1;
        feed(&mut conn, black_box(&line));
        drain_and_commit(&mut conn);
        iterations += 1;
    }

    let elapsed = start.elapsed();
    let total_bytes = iterations * bytes_per_write;
    eprintln!("request_flow: {} writes in {:?}", iterations, elapsed);
    eprintln!(
        "  {:.0} writes/s  {:.0} MB/s",
        iterations as f64 / elapsed.as_secs_f64(),
        (total_bytes as f64 / 1_000_000.0) / elapsed.as_secs_f64()
    );
}
