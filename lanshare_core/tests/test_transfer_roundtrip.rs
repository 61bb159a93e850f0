//! End-to-end transfers over loopback.

use lanshare_core::transfer::{Receiver, TransferOptions, send_file};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .try_init()
        .ok();
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn write_source(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, data).await.unwrap();
    path
}

#[tokio::test]
async fn test_round_trip_various_sizes() {
    init_tracing();

    for size in [0usize, 1, 4095, 4096, 4097, 100_000] {
        let src_dir = tempfile::tempdir().unwrap();
        let save_dir = tempfile::tempdir().unwrap();
        let data = patterned(size);
        let source = write_source(src_dir.path(), &format!("file_{}.bin", size), &data).await;

        let receiver = Receiver::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let opts = TransferOptions::default().with_port(receiver.local_addr().port());

        let save_path = save_dir.path().to_path_buf();
        let recv_opts = opts.clone();
        let recv_handle = tokio::spawn(async move {
            receiver.receive_file(&save_path, &recv_opts, None).await
        });

        let sent = send_file(&source, "127.0.0.1", &opts, None).await.unwrap();
        assert_eq!(sent, size as u64);

        let saved = recv_handle.await.unwrap().unwrap();
        assert!(saved.is_absolute());
        assert_eq!(saved.file_name().unwrap(), source.file_name().unwrap());
        assert_eq!(tokio::fs::read(&saved).await.unwrap(), data, "size {}", size);
    }
}

#[tokio::test]
async fn test_report_pdf_wire_format() {
    init_tracing();

    let src_dir = tempfile::tempdir().unwrap();
    let data = patterned(10_000);
    let source = write_source(src_dir.path(), "report.pdf", &data).await;

    // Plain listener standing in for a receiver, capturing raw bytes
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let capture = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut wire = Vec::new();
        stream.read_to_end(&mut wire).await.unwrap();
        wire
    });

    let opts = TransferOptions::default().with_port(port);
    send_file(&source, "127.0.0.1", &opts, None).await.unwrap();
    let wire = capture.await.unwrap();

    let expected_header = br#"{"filename": "report.pdf", "filesize": 10000}"#;
    let header_len = u32::from_be_bytes(wire[..4].try_into().unwrap()) as usize;
    assert_eq!(header_len, expected_header.len());
    assert_eq!(&wire[4..4 + header_len], expected_header);
    assert_eq!(&wire[4 + header_len..], &data[..]);
}

#[tokio::test]
async fn test_report_pdf_saved_with_declared_size() {
    let src_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let source = write_source(src_dir.path(), "report.pdf", &patterned(10_000)).await;

    let receiver = Receiver::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let opts = TransferOptions::default().with_port(receiver.local_addr().port());
    let save_path = save_dir.path().to_path_buf();
    let recv_opts = opts.clone();
    let recv_handle =
        tokio::spawn(async move { receiver.receive_file(&save_path, &recv_opts, None).await });

    send_file(&source, "127.0.0.1", &opts, None).await.unwrap();
    let saved = recv_handle.await.unwrap().unwrap();

    assert_eq!(
        saved,
        std::path::absolute(save_dir.path().join("report.pdf")).unwrap()
    );
    assert_eq!(tokio::fs::metadata(&saved).await.unwrap().len(), 10_000);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_ends_at_total() {
    let src_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let size = 3 * 4096 + 123;
    let source = write_source(src_dir.path(), "progress.bin", &patterned(size)).await;

    let send_progress = Arc::new(Mutex::new(Vec::new()));
    let recv_progress = Arc::new(Mutex::new(Vec::new()));

    let receiver = Receiver::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let opts = TransferOptions::default().with_port(receiver.local_addr().port());

    let save_path = save_dir.path().to_path_buf();
    let recv_opts = opts.clone();
    let recv_log = recv_progress.clone();
    let recv_handle = tokio::spawn(async move {
        let on_progress = move |done: u64, total: u64| recv_log.lock().unwrap().push((done, total));
        receiver
            .receive_file(&save_path, &recv_opts, Some(&on_progress))
            .await
    });

    let send_log = send_progress.clone();
    let on_progress = move |done: u64, total: u64| send_log.lock().unwrap().push((done, total));
    send_file(&source, "127.0.0.1", &opts, Some(&on_progress))
        .await
        .unwrap();
    recv_handle.await.unwrap().unwrap();

    for calls in [send_progress.lock().unwrap(), recv_progress.lock().unwrap()] {
        assert!(!calls.is_empty());
        assert!(calls.windows(2).all(|w| w[0].0 <= w[1].0));
        assert!(calls.iter().all(|&(done, total)| done <= total && total == size as u64));
        assert_eq!(calls.last().unwrap().0, size as u64);
    }

    // Sender reports once per 4KB chunk
    assert_eq!(send_progress.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_empty_file_reports_no_progress() {
    let src_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let source = write_source(src_dir.path(), "empty.txt", b"").await;

    let receiver = Receiver::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let opts = TransferOptions::default().with_port(receiver.local_addr().port());
    let save_path = save_dir.path().to_path_buf();
    let recv_opts = opts.clone();
    let recv_handle =
        tokio::spawn(async move { receiver.receive_file(&save_path, &recv_opts, None).await });

    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();
    let on_progress = move |_: u64, _: u64| *counter.lock().unwrap() += 1;
    send_file(&source, "127.0.0.1", &opts, Some(&on_progress))
        .await
        .unwrap();

    let saved = recv_handle.await.unwrap().unwrap();
    assert_eq!(tokio::fs::metadata(&saved).await.unwrap().len(), 0);
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_receiver_creates_missing_save_dir() {
    let src_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let nested = root.path().join("a").join("b");
    let source = write_source(src_dir.path(), "nested.txt", b"hello").await;

    let receiver = Receiver::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let opts = TransferOptions::default().with_port(receiver.local_addr().port());
    let save_path = nested.clone();
    let recv_opts = opts.clone();
    let recv_handle =
        tokio::spawn(async move { receiver.receive_file(&save_path, &recv_opts, None).await });

    send_file(&source, "127.0.0.1", &opts, None).await.unwrap();
    let saved = recv_handle.await.unwrap().unwrap();
    assert!(saved.starts_with(std::path::absolute(&nested).unwrap()));
    assert_eq!(tokio::fs::read(&saved).await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_receive_file_binds_all_interfaces() {
    let src_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let source = write_source(src_dir.path(), "any.txt", b"from anywhere").await;

    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };
    let opts = TransferOptions::default().with_port(port);

    let save_path = save_dir.path().to_path_buf();
    let recv_opts = opts.clone();
    let recv_handle = tokio::spawn(async move {
        lanshare_core::transfer::receive_file(&save_path, &recv_opts, None).await
    });

    // Retry until the receiver is listening
    let mut attempt = 0;
    let sent = loop {
        match send_file(&source, "127.0.0.1", &opts, None).await {
            Ok(n) => break n,
            Err(e) if e.is_connection() && attempt < 50 => {
                attempt += 1;
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            Err(e) => panic!("send failed: {}", e),
        }
    };
    assert_eq!(sent, 13);

    let saved = recv_handle.await.unwrap().unwrap();
    assert_eq!(tokio::fs::read(&saved).await.unwrap(), b"from anywhere");
}
