mod common;

use common::{sha256_hex, FakeItem, FakeUpstream, TestApp, STREAM_ID};

#[tokio::test]
async fn test_mirror_product_end_to_end() {
    let kernel: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let upstream = FakeUpstream::start(vec![(
        "p1",
        "20240101",
        vec![FakeItem::new("boot-kernel", kernel.clone())],
    )])
    .await;
    let app = TestApp::start().await;

    let streams = app
        .get_json(&format!("/api/upstream/streams?index_url={}", upstream.index_url()))
        .await;
    assert_eq!(streams[0]["stream_id"], STREAM_ID);
    assert_eq!(streams[0]["products"][0], "p1");

    let result = app.enqueue(&upstream.index_url(), &["p1"]).await;
    assert_eq!(result["enqueued"][0], "p1");
    let job_id = TestApp::job_ids(&result)["p1"];

    let job = app.wait_for_job(job_id).await;
    assert_eq!(job["status"], "completed", "job: {}", job);
    assert_eq!(job["progress"], 100);
    assert_eq!(job["version"], "20240101");

    let image_id = job["image_id"].as_i64().unwrap();
    let image = app.get_json(&format!("/api/images/{}", image_id)).await;
    assert_eq!(image["status"], "ready");
    assert_eq!(image["source"], "mirrored");
    assert_eq!(image["artifacts"].as_array().unwrap().len(), 1);
    let artifact = &image["artifacts"][0];
    assert_eq!(artifact["size"], 1000);
    assert_eq!(artifact["sha256"], sha256_hex(&kernel));

    // The artifact is served back byte for byte
    let download = artifact["download_url"].as_str().unwrap();
    let (status, body) = app.get_bytes(download).await;
    assert!(status.is_success());
    assert_eq!(body, kernel);

    // And published in the local tree
    let index = app.get_json("/streams/v1/index.json").await;
    let stream = &index["index"][STREAM_ID];
    assert_eq!(stream["products"][0], "p1");
    let products_path = stream["path"].as_str().unwrap();
    let products = app.get_json(&format!("/{}", products_path)).await;
    let item = &products["products"]["p1"]["versions"]["20240101"]["items"]["boot-kernel"];
    assert_eq!(item["sha256"], sha256_hex(&kernel));
    assert_eq!(item["size"], 1000);
    assert_eq!(
        item["path"].as_str().unwrap(),
        download.trim_start_matches('/')
    );
    assert_eq!(products["products"]["p1"]["release"], "noble");

    // Upstream fields the library has no column for are carried through
    let product = &products["products"]["p1"];
    assert_eq!(product["support_eol"], "2029-05-31");
    assert_eq!(product["versions"]["20240101"]["pubname"], "p1-20240101");
    assert_eq!(item["md5"], "d41d8cd98f00b204e9800998ecf8427e");
}

#[tokio::test]
async fn test_hash_mismatch_fails_job() {
    let body = vec![7u8; 512];
    let mut item = FakeItem::new("boot-kernel", body);
    item.sha256 = Some(sha256_hex(b"not the same bytes"));
    let upstream = FakeUpstream::start(vec![("p1", "20240101", vec![item])]).await;
    let app = TestApp::start().await;

    let result = app.enqueue(&upstream.index_url(), &["p1"]).await;
    let job = app.wait_for_job(TestApp::job_ids(&result)["p1"]).await;

    assert_eq!(job["status"], "failed");
    let message = job["message"].as_str().unwrap();
    assert!(message.contains("Integrity"), "message: {}", message);

    let image_id = job["image_id"].as_i64().unwrap();
    let image = app.get_json(&format!("/api/images/{}", image_id)).await;
    assert_eq!(image["status"], "error");
    assert!(image["artifacts"].as_array().unwrap().is_empty());

    let config = &app.state.config;
    let target = config
        .artifact_root
        .join(format!("mirror/{}/files/p1/boot-kernel", image_id));
    assert!(!target.exists());
    assert_eq!(std::fs::read_dir(&config.staging_dir).unwrap().count(), 0);

    // Nothing to publish
    let index = app.get_json("/streams/v1/index.json").await;
    assert!(index["index"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_product_fails_alone() {
    let upstream = FakeUpstream::start(vec![(
        "p1",
        "20240101",
        vec![FakeItem::new("boot-initrd", vec![1u8; 64])],
    )])
    .await;
    let app = TestApp::start().await;

    let result = app.enqueue(&upstream.index_url(), &["p1", "missing"]).await;
    let ids = TestApp::job_ids(&result);
    assert_eq!(ids.len(), 2);

    let good = app.wait_for_job(ids["p1"]).await;
    let bad = app.wait_for_job(ids["missing"]).await;
    assert_eq!(good["status"], "completed");
    assert_eq!(bad["status"], "failed");
    assert!(bad["message"].as_str().unwrap().contains("missing"));
    assert!(bad["image_id"].is_null());

    let jobs = app.get_json("/api/mirror/jobs").await;
    assert_eq!(jobs["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_blocked_index_is_rejected() {
    let app = TestApp::start().await;

    let response = app
        .client
        .post(app.url("/api/mirror"))
        .json(&serde_json::json!({
            "index_url": "file:///etc/passwd",
            "product_ids": ["p1"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "upstream_blocked");

    let jobs = app.get_json("/api/mirror/jobs").await;
    assert!(jobs["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_job_is_not_found() {
    let app = TestApp::start().await;
    let (status, _) = app.get_bytes("/api/mirror/jobs/999").await;
    assert_eq!(status.as_u16(), 404);
}
