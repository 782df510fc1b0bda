use std::sync::Arc;
use std::time::Duration;

use crawlpool::{Request, TaskQueue};

#[tokio::test]
async fn fifo_order() {
    let queue = TaskQueue::new();
    queue.push(Request::get("http://a/"));
    queue.push(Request::get("http://b/"));
    assert_eq!(queue.len(), 2);

    let first = queue.pop_timeout(Duration::from_millis(10)).await.unwrap();
    let second = queue.pop_timeout(Duration::from_millis(10)).await.unwrap();
    assert_eq!(first.url, "http://a/");
    assert_eq!(second.url, "http://b/");
    assert!(queue.is_empty());
}

#[tokio::test]
async fn pop_times_out_on_an_empty_queue() {
    let queue = TaskQueue::new();
    let start = tokio::time::Instant::now();
    let popped = queue.pop_timeout(Duration::from_millis(50)).await;
    assert!(popped.is_none());
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn pop_wakes_up_for_a_concurrent_push() {
    let queue = Arc::new(TaskQueue::new());
    let pusher = {
        let queue = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queue.push(Request::get("http://late/"));
        })
    };
    let popped = queue.pop_timeout(Duration::from_secs(5)).await;
    pusher.await.unwrap();
    assert_eq!(popped.unwrap().url, "http://late/");
}

#[tokio::test]
async fn dead_letter_requires_a_sink() {
    let queue = TaskQueue::new();
    let mut request = Request::get("http://x/");
    request.retry = 7;
    assert!(!queue.dead_letter(request));

    let captured: Arc<parking_lot::Mutex<Vec<Request>>> = Arc::default();
    let sink_ref = captured.clone();
    let queue = TaskQueue::new().with_dead_letter(Box::new(move |r| sink_ref.lock().push(r)));
    let mut request = Request::get("http://x/");
    request.retry = 7;
    assert!(queue.dead_letter(request));
    let captured = captured.lock();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].retry, 0);
}
