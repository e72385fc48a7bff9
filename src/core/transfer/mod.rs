//! The file-transfer protocol: wire framing, transactional file access and
//! the per-session state machines of both protocol sides.

pub mod files;
pub mod flight;
pub mod progress;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;
pub mod wire;

#[cfg(test)]
mod tests {
    //! End-to-end scenarios: a real sender and receiver session talking over
    //! loopback TCP.

    use crate::core::events::{
        DuplicateFile, DuplicateFileAction, DuplicateFileDecision, SessionState, SharingDecision,
        SharingRequest,
    };
    use crate::core::identity::ANONYMOUS_UUID;
    use crate::core::transfer::files::{FileStatus, TransferList};
    use crate::core::transfer::receiver::spawn_receiver;
    use crate::core::transfer::sender::spawn_sender;
    use crate::core::transfer::session::SessionHandle;
    use crate::core::transfer::wire::Command;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    /// Wait for a session to reach a terminal state.
    async fn wait_terminal(handle: &SessionHandle) -> SessionState {
        let mut state_rx = handle.subscribe();
        loop {
            let state = *state_rx.borrow();
            if state.is_terminal() {
                return state;
            }
            if state_rx.changed().await.is_err() {
                return *state_rx.borrow();
            }
        }
    }

    /// A sharing sink accepting every request into `dest`.
    fn accept_all_sink(
        dest: PathBuf,
    ) -> mpsc::Sender<(SharingRequest, tokio::sync::oneshot::Sender<SharingDecision>)> {
        let (tx, mut rx) = mpsc::channel::<(
            SharingRequest,
            tokio::sync::oneshot::Sender<SharingDecision>,
        )>(4);
        tokio::spawn(async move {
            while let Some((_request, reply)) = rx.recv().await {
                let _ = reply.send(SharingDecision::Accept {
                    path: dest.clone(),
                    message: String::new(),
                });
            }
        });
        tx
    }

    /// A sharing sink rejecting every request.
    fn reject_all_sink(
        message: &str,
    ) -> mpsc::Sender<(SharingRequest, tokio::sync::oneshot::Sender<SharingDecision>)> {
        let message = message.to_string();
        let (tx, mut rx) = mpsc::channel::<(
            SharingRequest,
            tokio::sync::oneshot::Sender<SharingDecision>,
        )>(4);
        tokio::spawn(async move {
            while let Some((_request, reply)) = rx.recv().await {
                let _ = reply.send(SharingDecision::Reject {
                    message: message.clone(),
                });
            }
        });
        tx
    }

    /// A duplicate sink answering a fixed action.
    fn duplicate_sink(
        action: DuplicateFileAction,
    ) -> mpsc::Sender<(DuplicateFile, tokio::sync::oneshot::Sender<DuplicateFileDecision>)> {
        let (tx, mut rx) = mpsc::channel::<(
            DuplicateFile,
            tokio::sync::oneshot::Sender<DuplicateFileDecision>,
        )>(4);
        tokio::spawn(async move {
            while let Some((_conflict, reply)) = rx.recv().await {
                let _ = reply.send(DuplicateFileDecision {
                    action,
                    apply_to_all: false,
                });
            }
        });
        tx
    }

    /// Spin up a listening receiver and a connecting sender for `list`.
    async fn start_pair(
        list: TransferList,
        sender_uuid: Uuid,
        sharing: mpsc::Sender<(SharingRequest, tokio::sync::oneshot::Sender<SharingDecision>)>,
        duplicates: mpsc::Sender<(
            DuplicateFile,
            tokio::sync::oneshot::Sender<DuplicateFileDecision>,
        )>,
    ) -> (SessionHandle, SessionHandle) {
        let receiver_uuid = Uuid::new_v4();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (receiver_handle_tx, receiver_handle_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (events_tx, _events_rx) = mpsc::unbounded_channel();
            let handle = spawn_receiver(stream, receiver_uuid, sharing, duplicates, events_tx);
            let _ = receiver_handle_tx.send(handle);
        });

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let sender_handle = spawn_sender(
            sender_uuid,
            receiver_uuid,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
            list,
            String::new(),
            events_tx,
        );

        let receiver_handle = receiver_handle_rx.await.unwrap();
        (sender_handle, receiver_handle)
    }

    fn make_source(files: &[(&str, &[u8])]) -> (tempfile::TempDir, TransferList) {
        let dir = tempfile::tempdir().unwrap();
        let mut roots = Vec::new();
        for (relative, content) in files {
            let absolute = dir.path().join(relative);
            std::fs::create_dir_all(absolute.parent().unwrap()).unwrap();
            std::fs::write(&absolute, content).unwrap();

            let root = Path::new(relative)
                .components()
                .next()
                .unwrap()
                .as_os_str();
            let root = dir.path().join(root);
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        let list = TransferList::from_paths(&roots).unwrap();
        (dir, list)
    }

    #[tokio::test]
    async fn test_happy_path_two_files() {
        let payload = vec![0xA5u8; 4096];
        let (_src, list) =
            make_source(&[("a.txt", b"hello greet"), ("b/c.bin", payload.as_slice())]);
        let dest = tempfile::tempdir().unwrap();

        let (sender, receiver) = start_pair(
            list,
            Uuid::new_v4(),
            accept_all_sink(dest.path().to_path_buf()),
            duplicate_sink(DuplicateFileAction::Keep),
        )
        .await;

        assert_eq!(wait_terminal(&sender).await, SessionState::Closed);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Closed);

        assert_eq!(
            std::fs::read(dest.path().join("a.txt")).unwrap(),
            b"hello greet"
        );
        assert_eq!(std::fs::read(dest.path().join("b/c.bin")).unwrap(), payload);

        for handle in [&sender, &receiver] {
            let info = handle.transfer_info();
            assert_eq!(info.total_files, 2);
            assert_eq!(info.transferred_files, 2);
            assert_eq!(info.skipped_files, 0);
            assert_eq!(info.transferred_bytes, 11 + 4096);
            assert_eq!(info.transferred_files + info.skipped_files, info.total_files);
        }
    }

    #[tokio::test]
    async fn test_zero_byte_file() {
        let (_src, list) = make_source(&[("empty.bin", b"")]);
        let dest = tempfile::tempdir().unwrap();

        let (sender, receiver) = start_pair(
            list,
            Uuid::new_v4(),
            accept_all_sink(dest.path().to_path_buf()),
            duplicate_sink(DuplicateFileAction::Keep),
        )
        .await;

        assert_eq!(wait_terminal(&sender).await, SessionState::Closed);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Closed);

        let dest_file = dest.path().join("empty.bin");
        assert!(dest_file.exists());
        assert_eq!(std::fs::metadata(&dest_file).unwrap().len(), 0);
        assert_eq!(receiver.transfer_info().transferred_files, 1);
    }

    #[tokio::test]
    async fn test_session_rejected() {
        let (_src, list) = make_source(&[("a.txt", b"hello")]);

        let (sender, receiver) = start_pair(
            list,
            Uuid::new_v4(),
            reject_all_sink("not now"),
            duplicate_sink(DuplicateFileAction::Keep),
        )
        .await;

        assert_eq!(wait_terminal(&sender).await, SessionState::Closed);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Closed);

        for handle in [&sender, &receiver] {
            let info = handle.transfer_info();
            assert_eq!(info.transferred_files, 0);
            assert_eq!(info.skipped_files, info.total_files);
            assert_eq!(info.skipped_bytes, info.total_bytes);
        }
    }

    #[tokio::test]
    async fn test_skip_missing_source_file() {
        let (src, list) = make_source(&[("gone.txt", b"bye"), ("stays.txt", b"here")]);
        std::fs::remove_file(src.path().join("gone.txt")).unwrap();
        let dest = tempfile::tempdir().unwrap();

        let (sender, receiver) = start_pair(
            list,
            Uuid::new_v4(),
            accept_all_sink(dest.path().to_path_buf()),
            duplicate_sink(DuplicateFileAction::Keep),
        )
        .await;

        assert_eq!(wait_terminal(&sender).await, SessionState::Closed);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Closed);

        assert!(!dest.path().join("gone.txt").exists());
        assert_eq!(std::fs::read(dest.path().join("stays.txt")).unwrap(), b"here");

        let info = receiver.transfer_info();
        assert_eq!(info.transferred_files, 1);
        assert_eq!(info.skipped_files, 1);
        assert_eq!(info.transferred_files + info.skipped_files, info.total_files);
    }

    #[tokio::test]
    async fn test_conflict_keep_both() {
        let (_src, list) = make_source(&[("a.txt", b"hello greet")]);
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("a.txt"), b"original").unwrap();

        let (sender, receiver) = start_pair(
            list,
            Uuid::new_v4(),
            accept_all_sink(dest.path().to_path_buf()),
            duplicate_sink(DuplicateFileAction::KeepBoth),
        )
        .await;

        assert_eq!(wait_terminal(&sender).await, SessionState::Closed);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Closed);

        assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap(), b"original");
        assert_eq!(
            std::fs::read(dest.path().join("a_1.txt")).unwrap(),
            b"hello greet"
        );
        assert_eq!(receiver.transfer_info().transferred_files, 1);
    }

    #[tokio::test]
    async fn test_conflict_keep_rejects_file() {
        let (_src, list) = make_source(&[("a.txt", b"hello greet")]);
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("a.txt"), b"original").unwrap();

        let (sender, receiver) = start_pair(
            list,
            Uuid::new_v4(),
            accept_all_sink(dest.path().to_path_buf()),
            duplicate_sink(DuplicateFileAction::Keep),
        )
        .await;

        assert_eq!(wait_terminal(&sender).await, SessionState::Closed);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Closed);

        assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap(), b"original");
        let info = receiver.transfer_info();
        assert_eq!(info.transferred_files, 0);
        assert_eq!(info.skipped_files, 1);
    }

    #[tokio::test]
    async fn test_conflict_replace_overwrites() {
        let (_src, list) = make_source(&[("a.txt", b"fresh data")]);
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("a.txt"), b"stale").unwrap();

        let (sender, receiver) = start_pair(
            list,
            Uuid::new_v4(),
            accept_all_sink(dest.path().to_path_buf()),
            duplicate_sink(DuplicateFileAction::Replace),
        )
        .await;

        assert_eq!(wait_terminal(&sender).await, SessionState::Closed);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Closed);
        assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap(), b"fresh data");
    }

    #[tokio::test]
    async fn test_tampered_source_rolls_back() {
        let (src, list) = make_source(&[("a.txt", b"first contents")]);
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("a.txt"), b"existing").unwrap();

        // The conflict decision gives us a deterministic window while the
        // sender already opened (and validated) the source: tamper it, then
        // let the transfer proceed. The sender's pre-COMMIT verification
        // must fail and both sides must roll back.
        let src_path = src.path().join("a.txt");
        let (dup_tx, mut dup_rx) = mpsc::channel::<(
            DuplicateFile,
            tokio::sync::oneshot::Sender<DuplicateFileDecision>,
        )>(4);
        tokio::spawn(async move {
            while let Some((_conflict, reply)) = dup_rx.recv().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
                std::fs::write(&src_path, b"other contents").unwrap();
                let _ = reply.send(DuplicateFileDecision {
                    action: DuplicateFileAction::Replace,
                    apply_to_all: false,
                });
            }
        });

        let (sender, receiver) = start_pair(
            list,
            Uuid::new_v4(),
            accept_all_sink(dest.path().to_path_buf()),
            dup_tx,
        )
        .await;

        assert_eq!(wait_terminal(&sender).await, SessionState::Closed);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Closed);

        // No partial file: the pre-existing destination is untouched.
        assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap(), b"existing");
        assert!(!dest.path().join("a.txt.part").exists());

        for handle in [&sender, &receiver] {
            let info = handle.transfer_info();
            assert_eq!(info.transferred_files, 0);
            assert_eq!(info.skipped_files, 1);
            assert_eq!(info.transferred_files + info.skipped_files, info.total_files);
        }
    }

    #[tokio::test]
    async fn test_oversized_chunk_aborts_receiver() {
        let dest = tempfile::tempdir().unwrap();
        let receiver_uuid = Uuid::new_v4();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let sharing = accept_all_sink(dest.path().to_path_buf());
        let duplicates = duplicate_sink(DuplicateFileAction::Keep);
        let (receiver_handle_tx, receiver_handle_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (events_tx, _events_rx) = mpsc::unbounded_channel();
            let handle = spawn_receiver(stream, receiver_uuid, sharing, duplicates, events_tx);
            let _ = receiver_handle_tx.send(handle);
        });

        // A malicious sender speaking the protocol by hand.
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
        let malicious_uuid = Uuid::new_v4();

        stream.write_u8(Command::Hello as u8).await.unwrap();
        stream.write_all(malicious_uuid.as_bytes()).await.unwrap();

        assert_eq!(stream.read_u8().await.unwrap(), Command::Hello as u8);
        let mut peer_uuid = [0u8; 16];
        stream.read_exact(&mut peer_uuid).await.unwrap();
        stream.write_u8(Command::Ack as u8).await.unwrap();

        // SHARE: one file of 9000 bytes, empty message.
        stream.write_u8(Command::Share as u8).await.unwrap();
        stream.write_u32_le(1).await.unwrap();
        stream.write_u64_le(9000).await.unwrap();
        stream.write_u32_le(0).await.unwrap();
        stream.write_u8(Command::Item as u8).await.unwrap();
        stream.write_u32_le(5).await.unwrap();
        stream.write_all(b"x.bin").await.unwrap();
        stream.write_u64_le(9000).await.unwrap();
        stream.write_u64_le(0).await.unwrap();
        stream.write_u8(Command::Share as u8).await.unwrap();

        // ACCEPT of the sharing request.
        assert_eq!(stream.read_u8().await.unwrap(), Command::Accept as u8);
        let ack_len = stream.read_u32_le().await.unwrap();
        let mut ack = vec![0u8; ack_len as usize];
        stream.read_exact(&mut ack).await.unwrap();

        // START, then a CHUNK framed over the limit.
        stream.write_u8(Command::Start as u8).await.unwrap();
        assert_eq!(stream.read_u8().await.unwrap(), Command::Accept as u8);
        stream.write_u8(Command::Chunk as u8).await.unwrap();
        stream.write_u32_le(9000).await.unwrap();

        let receiver = receiver_handle_rx.await.unwrap();
        assert_eq!(wait_terminal(&receiver).await, SessionState::Aborted);

        // Nothing was committed into the destination directory.
        let leftover: Vec<_> = std::fs::read_dir(dest.path()).unwrap().collect();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume_mid_transfer() {
        let payload = vec![7u8; 256 * 1024];
        let (_src, list) = make_source(&[("big.bin", payload.as_slice())]);
        let dest = tempfile::tempdir().unwrap();

        let (sender, receiver) = start_pair(
            list,
            Uuid::new_v4(),
            accept_all_sink(dest.path().to_path_buf()),
            duplicate_sink(DuplicateFileAction::Keep),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        sender.set_paused(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        sender.set_paused(false);

        assert_eq!(wait_terminal(&sender).await, SessionState::Closed);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Closed);
        assert_eq!(
            std::fs::read(dest.path().join("big.bin")).unwrap(),
            payload
        );
    }

    #[tokio::test]
    async fn test_peer_close_during_user_pause() {
        let dest = tempfile::tempdir().unwrap();
        let receiver_uuid = Uuid::new_v4();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let sharing = accept_all_sink(dest.path().to_path_buf());
        let duplicates = duplicate_sink(DuplicateFileAction::Keep);
        let (receiver_handle_tx, receiver_handle_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (events_tx, _events_rx) = mpsc::unbounded_channel();
            let handle = spawn_receiver(stream, receiver_uuid, sharing, duplicates, events_tx);
            let _ = receiver_handle_tx.send(handle);
        });

        // Handshake by hand, then stop talking.
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
        stream.write_u8(Command::Hello as u8).await.unwrap();
        stream.write_all(Uuid::new_v4().as_bytes()).await.unwrap();
        assert_eq!(stream.read_u8().await.unwrap(), Command::Hello as u8);
        let mut peer_uuid = [0u8; 16];
        stream.read_exact(&mut peer_uuid).await.unwrap();
        stream.write_u8(Command::Ack as u8).await.unwrap();

        let receiver = receiver_handle_rx.await.unwrap();
        let mut state_rx = receiver.subscribe();

        // Wait until the handshake is fully consumed, then pause.
        while *state_rx.borrow() != SessionState::Connected {
            state_rx.changed().await.unwrap();
        }
        receiver.set_paused(true);
        while *state_rx.borrow() != SessionState::PausedByUser {
            state_rx.changed().await.unwrap();
        }

        // The peer goes away without a CLOSE. The paused session must
        // notice on its own, resume and reach a terminal state without
        // anyone ever lifting the pause.
        drop(stream);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_terminate_aborts_both_sides() {
        let (_src, list) = make_source(&[("big.bin", b"payload bytes")]);
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("big.bin"), b"existing").unwrap();

        // Hold the duplicate decision open: the receiver parks, the sender
        // awaits the per-file verdict, and the termination lands in a
        // well-defined spot on both sides.
        let (dup_tx, mut dup_rx) = mpsc::channel::<(
            DuplicateFile,
            tokio::sync::oneshot::Sender<DuplicateFileDecision>,
        )>(1);
        let (arrived_tx, arrived_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let held = dup_rx.recv().await;
            let _ = arrived_tx.send(());
            std::future::pending::<()>().await;
            drop(held);
        });

        let (sender, receiver) = start_pair(
            list,
            Uuid::new_v4(),
            accept_all_sink(dest.path().to_path_buf()),
            dup_tx,
        )
        .await;

        arrived_rx.await.unwrap();
        receiver.terminate();

        assert_eq!(wait_terminal(&receiver).await, SessionState::Aborted);
        assert_eq!(wait_terminal(&sender).await, SessionState::Aborted);

        // Existing destination untouched, no partial file left behind.
        assert_eq!(
            std::fs::read(dest.path().join("big.bin")).unwrap(),
            b"existing"
        );
        assert!(!dest.path().join("big.bin.part").exists());

        let info = sender.transfer_info();
        assert_eq!(info.transferred_files + info.skipped_files, info.total_files);
    }

    #[tokio::test]
    async fn test_anonymous_sender_accepted() {
        let (_src, list) = make_source(&[("a.txt", b"anon")]);
        let dest = tempfile::tempdir().unwrap();

        let (sender, receiver) = start_pair(
            list,
            ANONYMOUS_UUID,
            accept_all_sink(dest.path().to_path_buf()),
            duplicate_sink(DuplicateFileAction::Keep),
        )
        .await;

        assert_eq!(wait_terminal(&sender).await, SessionState::Closed);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Closed);
        assert_eq!(receiver.peer_uuid(), ANONYMOUS_UUID);
        assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap(), b"anon");
    }

    #[tokio::test]
    async fn test_dropped_decision_sink_rejects() {
        let (_src, list) = make_source(&[("a.txt", b"hello")]);

        // A sink whose receiving side is immediately dropped.
        let (sharing_tx, sharing_rx) = mpsc::channel(1);
        drop(sharing_rx);

        let (sender, receiver) = start_pair(
            list,
            Uuid::new_v4(),
            sharing_tx,
            duplicate_sink(DuplicateFileAction::Keep),
        )
        .await;

        assert_eq!(wait_terminal(&sender).await, SessionState::Closed);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Closed);
        assert_eq!(sender.transfer_info().transferred_files, 0);
    }

    #[tokio::test]
    async fn test_file_statuses_reach_terminal_values() {
        let (_src, list) = make_source(&[("a.txt", b"hello greet")]);
        let dest = tempfile::tempdir().unwrap();

        let statuses: Vec<FileStatus> = list.files.iter().map(|f| f.status).collect();
        assert_eq!(statuses, vec![FileStatus::Scheduled]);

        let (sender, receiver) = start_pair(
            list,
            Uuid::new_v4(),
            accept_all_sink(dest.path().to_path_buf()),
            duplicate_sink(DuplicateFileAction::Keep),
        )
        .await;

        assert_eq!(wait_terminal(&sender).await, SessionState::Closed);
        assert_eq!(wait_terminal(&receiver).await, SessionState::Closed);

        let info = sender.transfer_info();
        assert_eq!(info.transferred_files, 1);
        assert!(info.file_in_transfer.is_none());
    }
}
