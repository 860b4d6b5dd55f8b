use rebound::Recycler;
use std::thread;

// A producer thread fills buffers, a consumer thread reads and releases
// them. Releases land in the consumer's intake queue for the producer's
// stack and come back on the producer's next acquires.
fn main() {
    let pool = Recycler::new(|| Vec::<u8>::with_capacity(1024)).unwrap();

    let (tx, rx) = std::sync::mpsc::sync_channel::<rebound::Recycled<Vec<u8>>>(16);
    let consumer = thread::spawn(move || {
        let mut bytes = 0usize;
        for mut buf in rx.iter() {
            bytes += buf.len();
            buf.clear();
            // dropped here, on a thread that does not own the buffer
        }
        bytes
    });

    for round in 0..10_000u32 {
        let mut buf = pool.acquire().unwrap();
        buf.extend_from_slice(&round.to_le_bytes());
        tx.send(buf).unwrap();
    }
    drop(tx);

    let bytes = consumer.join().unwrap();
    println!("consumed {bytes} bytes");
    println!("buffers idle on the producer thread: {}", pool.thread_local_size());
}
