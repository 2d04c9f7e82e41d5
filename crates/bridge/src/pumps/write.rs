//! Link write pump: serialises outbound messages.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Writes queued messages to the WebSocket until cancelled or closed.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                let Some(m) = msg else { break };
                let is_close = matches!(m, tungstenite::Message::Close(_));
                if let Err(e) = write.send(m).await {
                    error!(error = %e, "link write failed");
                    return;
                }
                if is_close {
                    return;
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;

    fn capture_sink(
        tx: mpsc::Sender<tungstenite::Message>,
    ) -> impl SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin {
        Box::pin(sink::unfold(tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tungstenite::Error>(tx)
        }))
    }

    #[tokio::test]
    async fn write_pump_sends_close_on_cancel() {
        let (sink_tx, mut sink_rx) = mpsc::channel::<tungstenite::Message>(16);
        let cancel = CancellationToken::new();

        let (_write_tx, write_rx) = mpsc::channel(16);
        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            write_pump(capture_sink(sink_tx), write_rx, c).await;
        });

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");

        let close_msg = sink_rx.recv().await;
        assert!(matches!(close_msg, Some(tungstenite::Message::Close(_))));
    }

    #[tokio::test]
    async fn write_pump_forwards_in_order() {
        let (sink_tx, mut sink_rx) = mpsc::channel::<tungstenite::Message>(16);
        let (write_tx, write_rx) = mpsc::channel(16);
        let handle = tokio::spawn(write_pump(
            capture_sink(sink_tx),
            write_rx,
            CancellationToken::new(),
        ));

        write_tx
            .send(tungstenite::Message::Text("a".into()))
            .await
            .unwrap();
        write_tx
            .send(tungstenite::Message::Text("b".into()))
            .await
            .unwrap();
        drop(write_tx);
        handle.await.unwrap();

        let mut texts = Vec::new();
        while let Some(msg) = sink_rx.recv().await {
            if let tungstenite::Message::Text(t) = msg {
                texts.push(t.as_str().to_string());
            }
        }
        assert_eq!(texts, vec!["a", "b"]);
    }
}
