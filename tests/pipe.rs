//! End-to-end pipe scenarios driving the public syscall surface.

use std::time::Duration;

use ukern::{boot, task, KernelError};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn loopback_across_threads() {
    init_logging();
    let status = boot(
        task(|_| {
            let (r, w) = ukern::pipe().unwrap();
            let writer = ukern::create_thread(
                task(move |_| {
                    assert_eq!(ukern::write(w, &[0x41, 0x42, 0x43, 0x44]), Ok(4));
                    ukern::close(w).unwrap();
                    0
                }),
                b"",
            )
            .unwrap();

            let mut buf = [0u8; 10];
            assert_eq!(ukern::read(r, &mut buf), Ok(4));
            assert_eq!(&buf[..4], &[0x41, 0x42, 0x43, 0x44]);

            assert_eq!(ukern::thread_join(writer), Ok(0));
            // Writer side closed and drained: end of data.
            assert_eq!(ukern::read(r, &mut buf), Ok(0));
            ukern::close(r).unwrap();
            0
        }),
        b"",
    );
    assert_eq!(status, 0);
}

#[test]
fn writer_blocks_on_full_pipe_then_drains() {
    init_logging();
    let status = boot(
        task(|_| {
            let (r, w) = ukern::pipe().unwrap();
            // 600 bytes into a 512-byte pipe: the writer must suspend and
            // finish only once the reader makes room.
            let writer = ukern::create_thread(
                task(move |_| {
                    let data: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
                    let n = ukern::write(w, &data).unwrap();
                    ukern::close(w).unwrap();
                    n as i32
                }),
                b"",
            )
            .unwrap();

            // Give the writer time to fill the buffer and block.
            std::thread::sleep(Duration::from_millis(30));

            let mut collected = Vec::new();
            let mut buf = vec![0u8; 200];
            loop {
                let n = ukern::read(r, &mut buf).unwrap();
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..n]);
            }
            assert_eq!(collected.len(), 600);
            let expected: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
            assert_eq!(collected, expected);

            // The writer delivered the full count despite blocking.
            assert_eq!(ukern::thread_join(writer), Ok(600));
            ukern::close(r).unwrap();
            0
        }),
        b"",
    );
    assert_eq!(status, 0);
}

#[test]
fn series_pipes_preserve_bytes() {
    init_logging();
    let status = boot(
        task(|_| {
            let (r1, w1) = ukern::pipe().unwrap();
            let (r2, w2) = ukern::pipe().unwrap();
            let data: Vec<u8> = (0..300).map(|i| (i * 7) as u8).collect();

            assert_eq!(ukern::write(w1, &data), Ok(300));
            ukern::close(w1).unwrap();

            // Relay the first pipe into the second.
            let mut buf = [0u8; 512];
            loop {
                let n = ukern::read(r1, &mut buf).unwrap();
                if n == 0 {
                    break;
                }
                assert_eq!(ukern::write(w2, &buf[..n]), Ok(n));
            }
            ukern::close(r1).unwrap();
            ukern::close(w2).unwrap();

            let mut out = Vec::new();
            loop {
                let n = ukern::read(r2, &mut buf).unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            ukern::close(r2).unwrap();
            assert_eq!(out, data);
            0
        }),
        b"",
    );
    assert_eq!(status, 0);
}

#[test]
fn pipe_shared_with_child_process() {
    init_logging();
    let status = boot(
        task(|_| {
            let (r, w) = ukern::pipe().unwrap();
            let child = ukern::exec(
                Some(task(move |_| {
                    // Inherited fids keep their numbers.
                    if ukern::write(w, b"from-child") != Ok(10) {
                        return 1;
                    }
                    ukern::close(w).unwrap();
                    ukern::close(r).unwrap();
                    0
                })),
                b"",
            )
            .unwrap();

            // Drop our writer so EOF arrives once the child is done.
            ukern::close(w).unwrap();
            let mut collected = Vec::new();
            let mut buf = [0u8; 32];
            loop {
                let n = ukern::read(r, &mut buf).unwrap();
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..n]);
            }
            assert_eq!(collected, b"from-child");
            ukern::close(r).unwrap();

            let (pid, child_status) = ukern::wait_child(None).unwrap();
            assert_eq!(pid, child);
            child_status
        }),
        b"",
    );
    assert_eq!(status, 0);
}

#[test]
fn reader_close_unblocks_writer_with_partial_count() {
    init_logging();
    let status = boot(
        task(|_| {
            let (r, w) = ukern::pipe().unwrap();
            let writer = ukern::create_thread(
                task(move |_| {
                    // More than the buffer holds: this blocks until the
                    // reader goes away, then reports the partial count.
                    let data = vec![0xA5u8; 2 * 512];
                    match ukern::write(w, &data) {
                        Ok(n) => n as i32,
                        Err(_) => -1,
                    }
                }),
                b"",
            )
            .unwrap();

            std::thread::sleep(Duration::from_millis(30));
            ukern::close(r).unwrap();

            let delivered = ukern::thread_join(writer).unwrap();
            assert_eq!(delivered, 512);

            // The writer side saw the close; further writes fail outright.
            assert_eq!(ukern::write(w, b"x"), Err(KernelError::PeerClosed));
            ukern::close(w).unwrap();
            0
        }),
        b"",
    );
    assert_eq!(status, 0);
}
