//! The six literal end-to-end scenarios the kernel is validated against.
//! Each test name matches the scenario it exercises so a failure points
//! straight back to the behavior it covers.

use std::collections::HashMap;
use std::time::Duration;

use csp_kernel::{
    BroadcastChannel, BroadcastConfig, Channel, ChannelConfig, ChannelError, Deadline, Priority, read_from_any,
};

#[tokio::test]
async fn ping_pong() {
    let c = Channel::<&'static str>::new(ChannelConfig::default()).unwrap();
    let writer = {
        let c = c.clone();
        tokio::spawn(async move { c.write("hello", None, Deadline::Infinite).await })
    };
    let received = c.read(None, Deadline::Infinite).await.unwrap();
    assert_eq!(received, "hello");
    writer.await.unwrap().unwrap();
    assert!(c.last_read_tick() >= c.last_write_tick());
}

#[tokio::test]
async fn buffered_retire() {
    let c = Channel::<i32>::new(ChannelConfig::default().with_buffer(2)).unwrap();
    c.write(1, None, Deadline::Immediate).await.unwrap();
    c.write(2, None, Deadline::Immediate).await.unwrap();
    let third = {
        let c = c.clone();
        tokio::spawn(async move { c.write(3, None, Deadline::Infinite).await })
    };
    tokio::task::yield_now().await;

    c.retire(false);

    assert_eq!(c.read(None, Deadline::Immediate).await.unwrap(), 1);
    assert_eq!(c.read(None, Deadline::Immediate).await.unwrap(), 2);
    assert_eq!(c.read(None, Deadline::Immediate).await.unwrap(), 3);
    third.await.unwrap().unwrap();
    assert_eq!(c.read(None, Deadline::Immediate).await, Err(ChannelError::Retired));
}

#[tokio::test(start_paused = true)]
async fn timeout_race() {
    let c = Channel::<i32>::new(ChannelConfig::default()).unwrap();
    let start = tokio::time::Instant::now();
    let result = c.read(None, Deadline::ms(50)).await;
    assert_eq!(result, Err(ChannelError::Timeout));
    assert!(tokio::time::Instant::now() - start >= Duration::from_millis(50));
    assert_eq!(c.len(), 0);
}

#[tokio::test]
async fn select_first() {
    let c1 = Channel::<i32>::new(ChannelConfig::default()).unwrap();
    let c2 = Channel::<i32>::new(ChannelConfig::default().with_buffer(1)).unwrap();
    c2.write(42, None, Deadline::Immediate).await.unwrap();

    let (idx, value) = read_from_any(&[&c1, &c2], Priority::First, Deadline::Immediate).await.unwrap();
    assert_eq!(idx, 1);
    assert_eq!(value, 42);
    assert_eq!(c1.read(None, Deadline::Immediate).await, Err(ChannelError::Timeout));
}

#[tokio::test]
async fn select_fairness() {
    let trials = 200;
    let mut wins: HashMap<usize, usize> = HashMap::new();

    for _ in 0..trials {
        let c1 = Channel::<&'static str>::new(ChannelConfig::default()).unwrap();
        let c2 = Channel::<&'static str>::new(ChannelConfig::default()).unwrap();
        let w1 = {
            let c1 = c1.clone();
            tokio::spawn(async move { c1.write("A", None, Deadline::Infinite).await })
        };
        let w2 = {
            let c2 = c2.clone();
            tokio::spawn(async move { c2.write("B", None, Deadline::Infinite).await })
        };
        tokio::task::yield_now().await;

        let (idx, value) = read_from_any(&[&c1, &c2], Priority::Random, Deadline::Infinite).await.unwrap();
        *wins.entry(idx).or_default() += 1;
        match idx {
            0 => {
                assert_eq!(value, "A");
                w1.await.unwrap().unwrap();
                // the losing writer never got a peer; abort its still-blocked task.
                w2.abort();
            }
            1 => {
                assert_eq!(value, "B");
                w2.await.unwrap().unwrap();
                w1.abort();
            }
            _ => unreachable!(),
        }
    }

    let c0 = *wins.get(&0).unwrap_or(&0);
    let c1_wins = *wins.get(&1).unwrap_or(&0);
    assert_eq!(c0 + c1_wins, trials);
    // Loose bound: both sides must show up, confirming no permanent bias.
    assert!(c0 > trials / 4, "channel 0 won {c0}/{trials} times");
    assert!(c1_wins > trials / 4, "channel 1 won {c1_wins}/{trials} times");
}

#[tokio::test]
async fn broadcast_barrier() {
    let b = BroadcastChannel::<i32>::new(BroadcastConfig::default().with_initial_barrier(3).with_minimum(3));

    let r1 = {
        let b = b.clone();
        tokio::spawn(async move { b.read(None, Deadline::Infinite).await })
    };
    let r2 = {
        let b = b.clone();
        tokio::spawn(async move { b.read(None, Deadline::Infinite).await })
    };
    tokio::task::yield_now().await;
    assert_eq!(b.joined_readers(), 2);

    let writer = {
        let b = b.clone();
        tokio::spawn(async move { b.write(7, None, Deadline::Infinite).await })
    };
    tokio::task::yield_now().await;
    assert!(!writer.is_finished());

    let r3 = {
        let b = b.clone();
        tokio::spawn(async move { b.read(None, Deadline::Infinite).await })
    };

    assert_eq!(r1.await.unwrap().unwrap(), 7);
    assert_eq!(r2.await.unwrap().unwrap(), 7);
    assert_eq!(r3.await.unwrap().unwrap(), 7);
    writer.await.unwrap().unwrap();
}
