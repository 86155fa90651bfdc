use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use seqmirror_store::{HttpStore, HttpStoreConfig, ObjectStore, StoreError};
use serde_json::{json, Value};
use tiny_http::{Header, Method, Response, Server};

const AUTH: &str = "Basic QUtJRDpzM2NyZXQ=";

#[derive(Default)]
struct GatewayState {
    objects: BTreeMap<String, Vec<u8>>,
    digests: BTreeMap<String, String>,
    uploads: BTreeMap<String, BTreeMap<u64, Vec<u8>>>,
    writes: usize,
}

struct Gateway {
    server: Arc<Server>,
    state: Arc<Mutex<GatewayState>>,
    worker: Option<thread::JoinHandle<()>>,
    endpoint: String,
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(b) => out.push(b),
                    Err(_) => out.extend_from_slice(&bytes[i..i + 3]),
                }
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("header")
}

fn start_gateway() -> Gateway {
    let server = Arc::new(Server::http("127.0.0.1:0").expect("bind"));
    let addr = server.server_addr().to_ip().expect("ip listener");
    let state = Arc::new(Mutex::new(GatewayState::default()));
    let worker_server = Arc::clone(&server);
    let worker_state = Arc::clone(&state);
    let worker = thread::spawn(move || {
        for mut request in worker_server.incoming_requests() {
            let authorized = request
                .headers()
                .iter()
                .any(|h| h.field.equiv("Authorization") && h.value.as_str() == AUTH);
            if !authorized {
                let _ = request.respond(Response::from_string("denied").with_status_code(403));
                continue;
            }
            let url = request.url().to_string();
            let (path, query) = url.split_once('?').unwrap_or((url.as_str(), ""));
            let query: BTreeMap<String, String> = query
                .split('&')
                .filter(|kv| !kv.is_empty())
                .map(|kv| {
                    let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
                    (percent_decode(k), percent_decode(v))
                })
                .collect();
            let path = percent_decode(path.trim_start_matches('/'));
            let (bucket, name) = path.split_once('/').unwrap_or((path.as_str(), ""));
            if bucket != "runs" {
                let _ = request.respond(Response::from_string("no bucket").with_status_code(404));
                continue;
            }
            let digest = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("x-content-sha256"))
                .map(|h| h.value.as_str().to_string());
            let mut body = Vec::new();
            let _ = request.as_reader().read_to_end(&mut body);
            let mut st = worker_state.lock().expect("state");
            let method = request.method().clone();
            let response = match (method, name.is_empty()) {
                (Method::Get, true) => {
                    let prefix = query.get("prefix").cloned().unwrap_or_default();
                    let delimited = query.contains_key("delimiter");
                    let mut objects = Vec::new();
                    let mut prefixes = Vec::new();
                    for (key, data) in st.objects.iter() {
                        let Some(rest) = key.strip_prefix(prefix.as_str()) else {
                            continue;
                        };
                        if delimited {
                            if let Some((dir, _)) = rest.split_once('/') {
                                let p = format!("{}{}/", prefix, dir);
                                if !prefixes.contains(&p) {
                                    prefixes.push(p);
                                }
                                continue;
                            }
                        }
                        objects.push(json!({"name": key, "size": data.len()}));
                    }
                    Response::from_string(
                        json!({"objects": objects, "prefixes": prefixes}).to_string(),
                    )
                }
                (Method::Head, false) => match st.objects.get(name) {
                    Some(data) => Response::from_string("")
                        .with_header(header("x-object-size", &data.len().to_string())),
                    None => Response::from_string("").with_status_code(404),
                },
                (Method::Get, false) => match st.objects.get(name) {
                    Some(data) => Response::from_data(data.clone()),
                    None => Response::from_string("missing").with_status_code(404),
                },
                (Method::Put, false) => {
                    if let Some(upload_id) = query.get("uploadId") {
                        let part: u64 = query
                            .get("partNumber")
                            .and_then(|p| p.parse().ok())
                            .unwrap_or(0);
                        st.uploads
                            .entry(upload_id.clone())
                            .or_default()
                            .insert(part, body);
                        Response::from_string("")
                            .with_header(header("ETag", &format!("\"etag-{}\"", part)))
                    } else {
                        st.objects.insert(name.to_string(), body);
                        if let Some(d) = digest {
                            st.digests.insert(name.to_string(), d);
                        }
                        st.writes += 1;
                        Response::from_string("")
                    }
                }
                (Method::Post, false) if query.contains_key("uploads") => {
                    let upload_id = format!("upload-{}", st.uploads.len() + 1);
                    st.uploads.insert(upload_id.clone(), BTreeMap::new());
                    Response::from_string(json!({"upload_id": upload_id}).to_string())
                }
                (Method::Post, false) => {
                    let upload_id = query.get("uploadId").cloned().unwrap_or_default();
                    let manifest: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                    let parts = st.uploads.remove(&upload_id).unwrap_or_default();
                    let listed = manifest
                        .get("parts")
                        .and_then(|p| p.as_array())
                        .map(|a| a.len())
                        .unwrap_or(0);
                    if listed != parts.len() {
                        Response::from_string("part mismatch").with_status_code(400)
                    } else {
                        let data: Vec<u8> = parts.into_values().flatten().collect();
                        st.objects.insert(name.to_string(), data);
                        if let Some(d) = digest {
                            st.digests.insert(name.to_string(), d);
                        }
                        st.writes += 1;
                        Response::from_string("")
                    }
                }
                _ => Response::from_string("unsupported").with_status_code(405),
            };
            drop(st);
            let _ = request.respond(response);
        }
    });
    Gateway {
        server,
        state,
        worker: Some(worker),
        endpoint: format!("http://{}/", addr),
    }
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "seqmirror_http_{}_{}_{}",
        tag,
        std::process::id(),
        chrono::Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

fn store_for(gateway: &Gateway, secret: &str) -> HttpStore {
    let mut config = HttpStoreConfig::new(&gateway.endpoint, "runs", "AKID", secret);
    config.preferred_part_size = 4;
    HttpStore::new(config).expect("store")
}

#[test]
fn single_and_multipart_uploads_land_with_digest() {
    let gateway = start_gateway();
    let store = store_for(&gateway, "s3cret");
    let root = scratch_dir("upload");
    let src = root.join("0001.bcl.bgzf");
    fs::write(&src, b"abcdefghij").expect("write");

    store
        .put(&src, "200101_NB501234_0001_AHXXXXXX/RunInfo.xml", false)
        .expect("single put");
    store
        .put(&src, "200101_NB501234_0001_AHXXXXXX/Data/0001.bcl.bgzf", true)
        .expect("multipart put");

    assert_eq!(
        store
            .size("200101_NB501234_0001_AHXXXXXX/Data/0001.bcl.bgzf")
            .expect("size"),
        Some(10)
    );
    assert_eq!(store.size("200101_NB501234_0001_AHXXXXXX/nope").expect("size"), None);

    let expected_digest = seqmirror_store::sha256_file(&src).expect("digest");
    let st = gateway.state.lock().expect("state");
    assert_eq!(
        st.objects
            .get("200101_NB501234_0001_AHXXXXXX/Data/0001.bcl.bgzf")
            .map(|d| d.as_slice()),
        Some(&b"abcdefghij"[..])
    );
    assert_eq!(
        st.digests
            .get("200101_NB501234_0001_AHXXXXXX/Data/0001.bcl.bgzf"),
        Some(&expected_digest)
    );
    assert_eq!(
        st.digests.get("200101_NB501234_0001_AHXXXXXX/RunInfo.xml"),
        Some(&expected_digest)
    );
    assert_eq!(st.writes, 2);
    drop(st);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn listing_and_download() {
    let gateway = start_gateway();
    let store = store_for(&gateway, "s3cret");
    let root = scratch_dir("listing");
    let src = root.join("payload");
    fs::write(&src, b"payload").expect("write");
    for name in [
        "200101_NB501234_0001_AHXXXXXX/Config/a.cfg",
        "200101_NB501234_0001_AHXXXXXX/RunInfo.xml",
        "200102_NB501234_0002_BHXXXXXX/RunInfo.xml",
    ] {
        store.put(&src, name, false).expect("put");
    }

    assert_eq!(
        store.list_children("").expect("children"),
        vec!["200101_NB501234_0001_AHXXXXXX", "200102_NB501234_0002_BHXXXXXX"]
    );
    assert_eq!(
        store
            .list_children("200101_NB501234_0001_AHXXXXXX")
            .expect("children"),
        vec!["Config", "RunInfo.xml"]
    );
    assert_eq!(
        store.list("200101_NB501234_0001_AHXXXXXX/").expect("list").len(),
        2
    );
    assert!(store
        .path_exists("200101_NB501234_0001_AHXXXXXX/Config")
        .expect("prefix"));

    let out = root.join("down").join("RunInfo.xml");
    store
        .get("200102_NB501234_0002_BHXXXXXX/RunInfo.xml", &out)
        .expect("get");
    assert_eq!(fs::read(&out).expect("read"), b"payload");
    assert!(matches!(
        store.get("200102_NB501234_0002_BHXXXXXX/absent", &out),
        Err(StoreError::NotFound(_))
    ));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn wrong_credentials_are_fatal() {
    let gateway = start_gateway();
    let store = store_for(&gateway, "wrong");
    let err = store.list("").expect_err("must be rejected");
    assert!(err.is_fatal(), "unexpected error: {}", err);
}
