#![forbid(unsafe_code)]

//! Asynchronous request variants of the serialized state manager.

use sigcell::{
    Signal, StateConfig, StateError, UpdateFaultPolicy, create_state, create_state_with_config,
};

#[tokio::test]
async fn async_update_and_get() {
    let s = create_state(0, |msg: i32, model: &i32| model + msg).unwrap();

    assert_eq!(s.update_async(3).await.unwrap(), 3);
    assert_eq!(s.update_async(4).await.unwrap(), 7);
    assert_eq!(s.get_async().await.unwrap(), 7);
    assert_eq!(s.set_async(-1).await.unwrap(), -1);
    assert_eq!(s.value(), -1);
    s.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_requests_from_many_tasks() {
    let s = create_state(0u64, |msg: u64, model: &u64| model + msg).unwrap();

    let tasks: Vec<_> = (1..=50u64)
        .map(|i| {
            let s = s.clone();
            tokio::spawn(async move { s.update_async(i).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(s.get_async().await.unwrap(), (1..=50).sum::<u64>());
    s.dispose();
}

#[tokio::test]
async fn futures_resolve_in_queue_order() {
    let s = create_state(Vec::new(), |msg: u8, model: &Vec<u8>| {
        let mut next = model.clone();
        next.push(msg);
        next
    })
    .unwrap();

    // Queued at call time, awaited in reverse.
    let a = s.update_async(1);
    let b = s.update_async(2);
    let c = s.update_async(3);
    assert_eq!(c.await.unwrap(), vec![1, 2, 3]);
    assert_eq!(b.await.unwrap(), vec![1, 2]);
    assert_eq!(a.await.unwrap(), vec![1]);
    s.dispose();
}

#[tokio::test]
async fn async_fault_reaches_only_its_caller() {
    let s = create_state(10, |msg: i32, model: &i32| {
        if msg < 0 {
            panic!("negative");
        }
        model + msg
    })
    .unwrap();

    let bad = s.update_async(-1);
    let good = s.update_async(5);
    assert!(matches!(bad.await, Err(StateError::UpdatePanicked { .. })));
    assert_eq!(good.await.unwrap(), 15);
    s.dispose();
}

#[tokio::test]
async fn async_after_terminate_is_closed() {
    let config = StateConfig::default().with_fault_policy(UpdateFaultPolicy::Terminate);
    let s = create_state_with_config(
        0,
        |msg: i32, _model: &i32| {
            if msg == 0 {
                panic!("stop");
            }
            msg
        },
        config,
    )
    .unwrap();

    let fault = s.update_async(0);
    let after = s.update_async(1);
    assert!(matches!(fault.await, Err(StateError::UpdatePanicked { .. })));
    assert!(matches!(after.await, Err(StateError::Closed)));
}

#[tokio::test]
async fn async_after_dispose_fails_fast() {
    let s = create_state(0, |msg: i32, model: &i32| model + msg).unwrap();
    s.dispose();
    assert!(matches!(s.get_async().await, Err(StateError::Disposed)));
    assert!(matches!(s.update_async(1).await, Err(StateError::Disposed)));
}
