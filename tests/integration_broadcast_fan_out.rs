use std::time::Duration;
use yogi_branch::{Branch, BranchConfig, Encoding, BranchEventKind::ConnectFinished, ALL_EVENTS};

fn config(name: &str, net: &str, adv_port: u16) -> BranchConfig {
    BranchConfig {
        name: name.to_string(),
        description: String::new(),
        network_name: net.to_string(),
        password: String::new(),
        path: format!("/{name}"),
        advertising_address: format!("239.255.97.5:{adv_port}").parse().unwrap(),
        advertising_interval_ms: Some(50),
        tcp_bind_address: "127.0.0.1:0".parse().unwrap(),
        timeout_ms: Some(500),
        ghost_mode: false,
        tx_queue_size: 32,
        rx_queue_size: 32,
    }
}

async fn wait_connected(branch: &Branch) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ev = branch.await_event(ALL_EVENTS).await.unwrap();
            if ev.kind == ConnectFinished && ev.result.is_ok() {
                return;
            }
        }
    })
    .await
    .expect("branch should finish connecting within the timeout");
}

#[tokio::test]
async fn a_broadcast_sent_by_one_branch_is_received_by_the_other() {
    let a = Branch::new(config("sender", "bcast-net", 21101)).await.unwrap();
    let b = Branch::new(config("receiver", "bcast-net", 21101)).await.unwrap();

    tokio::join!(wait_connected(&a), wait_connected(&b));

    let payload = serde_json::json!({"msg": "hello"}).to_string();
    a.send_broadcast(payload.as_bytes(), Encoding::Json, false)
        .await
        .unwrap();

    let mut buf = vec![0u8; 1024];
    let n = tokio::time::timeout(
        Duration::from_secs(2),
        b.receive_broadcast(Encoding::Json, &mut buf),
    )
    .await
    .expect("receive_broadcast should not time out")
    .unwrap();

    let received: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
    assert_eq!(received["msg"], "hello");
}

#[tokio::test]
async fn a_broadcast_reaches_every_other_connected_branch() {
    let a = Branch::new(config("hub", "bcast-net-2", 21102)).await.unwrap();
    let b = Branch::new(config("leaf-1", "bcast-net-2", 21102)).await.unwrap();
    let c = Branch::new(config("leaf-2", "bcast-net-2", 21102)).await.unwrap();

    for _ in 0..2 {
        wait_connected(&a).await;
    }
    wait_connected(&b).await;
    wait_connected(&c).await;

    for _ in 0..100 {
        if a.connected_branches().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(a.connected_branches().len(), 2);

    let payload = serde_json::json!({"msg": "fan-out"}).to_string();
    a.send_broadcast(payload.as_bytes(), Encoding::Json, false)
        .await
        .unwrap();

    let mut buf_b = vec![0u8; 1024];
    let mut buf_c = vec![0u8; 1024];
    let (n_b, n_c) = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(
            b.receive_broadcast(Encoding::Json, &mut buf_b),
            c.receive_broadcast(Encoding::Json, &mut buf_c),
        )
    })
    .await
    .expect("both leaves should receive the broadcast");

    let n_b = n_b.unwrap();
    let n_c = n_c.unwrap();
    let v_b: serde_json::Value = serde_json::from_slice(&buf_b[..n_b]).unwrap();
    let v_c: serde_json::Value = serde_json::from_slice(&buf_c[..n_c]).unwrap();
    assert_eq!(v_b["msg"], "fan-out");
    assert_eq!(v_c["msg"], "fan-out");
}
