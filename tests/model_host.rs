use anyhow::Result;
use forecaster::commands::forecast_all;
use forecaster::config::ForecastSettings;
use forecaster::context::ExecutionContext;
use forecaster::market_data::MarketDataSnapshot;
use forecaster::models::{ForecastRecord, Histories};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex, Once};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// In-process stand-in for the model host: point forecasts climb by one per
/// step, sampled trajectories sit 1% above the last context value.
struct ModelHostStub {
    base_url: String,
    events: Arc<Mutex<Vec<String>>>,
    shutdown: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ModelHostStub {
    fn start() -> Result<Self> {
        let mut listener: Option<TcpListener> = None;
        for _ in 0..64 {
            let port = fastrand::u16(40_000..60_000);
            if let Ok(bound) = TcpListener::bind(("127.0.0.1", port)) {
                listener = Some(bound);
                break;
            }
        }
        let listener = match listener {
            Some(listener) => listener,
            None => TcpListener::bind("127.0.0.1:0")?,
        };
        listener.set_nonblocking(true)?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let (shutdown, shutdown_rx) = mpsc::channel();
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&events);

        let handle = thread::spawn(move || loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nonblocking(false);
                    let _ = handle_model_host_request(stream, &recorded);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        });

        Ok(Self {
            base_url,
            events,
            shutdown,
            handle: Some(handle),
        })
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl Drop for ModelHostStub {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_model_host_request(
    mut stream: TcpStream,
    events: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(());
    }
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Ok(());
    }
    let method = parts[0].to_string();
    let path = parts[1].to_string();

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header == "\r\n" {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (method.as_str(), segments.as_slice()) {
        ("POST", ["models", "load"]) => {
            let model = payload["model"].as_str().unwrap_or_default().to_string();
            let device = payload["device"].as_str().unwrap_or_default().to_string();
            events
                .lock()
                .unwrap()
                .push(format!("load {} on {}", model, device));
            let reply = json!({ "sessionId": format!("{}-session", model) });
            write_json_response(&mut stream, "200 OK", &reply.to_string())
        }
        ("POST", ["sessions", session, "forecast"]) => {
            let last = last_context_value(&payload);
            let horizon = payload["horizon"].as_u64().unwrap_or(0) as usize;
            let curve: Vec<f64> = (1..=horizon).map(|step| last + step as f64).collect();
            events.lock().unwrap().push(format!("forecast {}", session));
            let reply = json!({ "forecast": [curve] });
            write_json_response(&mut stream, "200 OK", &reply.to_string())
        }
        ("POST", ["sessions", session, "sample"]) => {
            let last = last_context_value(&payload);
            let length = payload["predictionLength"].as_u64().unwrap_or(0) as usize;
            let samples = payload["numSamples"].as_u64().unwrap_or(0) as usize;
            events.lock().unwrap().push(format!("sample {}", session));
            let reply = json!({ "samples": vec![vec![last * 1.01; length]; samples] });
            write_json_response(&mut stream, "200 OK", &reply.to_string())
        }
        ("DELETE", ["sessions", session]) => {
            events.lock().unwrap().push(format!("delete {}", session));
            write_empty_response(&mut stream, "204 No Content")
        }
        _ => write_empty_response(&mut stream, "404 Not Found"),
    }
}

fn last_context_value(payload: &Value) -> f64 {
    payload["context"]
        .as_array()
        .and_then(|values| values.last())
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

fn write_json_response(stream: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())
}

fn write_empty_response(stream: &mut TcpStream, status: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status
    );
    stream.write_all(response.as_bytes())
}

fn settings_for(stub: &ModelHostStub) -> ForecastSettings {
    let mut env = HashMap::new();
    env.insert("MODEL_HOST_URL".to_string(), stub.base_url.clone());
    ForecastSettings::from_settings_map(&env).expect("settings")
}

fn histories() -> Histories {
    let mut histories = Histories::new();
    histories.insert("AAA".to_string(), vec![100.0; 300]);
    histories.insert("BBB".to_string(), vec![50.0; 40]);
    histories.insert("NEW".to_string(), vec![10.0; 5]);
    histories
}

fn position_of(events: &[String], wanted: &str) -> usize {
    events
        .iter()
        .position(|event| event == wanted)
        .unwrap_or_else(|| panic!("missing event {wanted:?} in {events:?}"))
}

#[test]
fn orchestrator_over_model_host_unloads_point_model_before_sampling() {
    ensure_test_env();
    let stub = ModelHostStub::start().expect("stub");
    let settings = settings_for(&stub);
    let orchestrator = forecast_all::build_orchestrator(
        &settings.foundation,
        ExecutionContext::new("cuda", 2, 64).expect("context"),
    )
    .expect("orchestrator");

    let results = orchestrator.predict_all(&histories());

    let tickers: Vec<&str> = results.keys().map(String::as_str).collect();
    assert_eq!(tickers, vec!["AAA", "BBB"]);
    let aaa = &results["AAA"];
    assert!((aaa["timesfm"].get("1d").unwrap() - 1.0).abs() < 1e-9);
    assert!((aaa["timesfm"].get("1y").unwrap() - 252.0).abs() < 1e-9);
    assert_eq!(aaa["chronos"].len(), 5);
    for (_, growth) in aaa["chronos"].iter() {
        assert!((growth - 1.0).abs() < 1e-9);
    }
    assert!((results["BBB"]["timesfm"].get("1w").unwrap() - 10.0).abs() < 1e-9);

    let events = stub.events();
    assert_eq!(events[0], "load timesfm on cuda");
    let point_closed = position_of(&events, "delete timesfm-session");
    let sampling_loaded = position_of(&events, "load chronos on cpu");
    assert!(point_closed < sampling_loaded, "{events:?}");
    assert_eq!(events.last().map(String::as_str), Some("delete chronos-session"));
    assert_eq!(
        events.iter().filter(|event| event.starts_with("forecast")).count(),
        2
    );
    assert_eq!(
        events.iter().filter(|event| event.starts_with("sample")).count(),
        4
    );
    assert_eq!(orchestrator.residency().peak(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forecast_all_writes_camel_case_records() {
    ensure_test_env();
    let stub = ModelHostStub::start().expect("stub");
    let settings = settings_for(&stub);
    let dir: PathBuf = std::env::temp_dir().join(format!("forecaster-host-{}", Uuid::new_v4()));
    let data_file = dir.join("market-data.bin");
    let output = dir.join("forecasts.json");
    MarketDataSnapshot::new(histories())
        .save_to_file(&data_file)
        .expect("snapshot");

    forecast_all::run(
        &settings,
        ExecutionContext::cpu().expect("cpu"),
        &data_file,
        &["aaa".to_string(), "NEW".to_string()],
        Some(output.clone()),
    )
    .await
    .expect("forecast-all");

    let raw: Value = serde_json::from_slice(&std::fs::read(&output).expect("output")).expect("json");
    let rows = raw.as_array().expect("array");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["ticker"], "AAA");
    assert!(rows[0]["generatedAt"].is_string());
    assert!(rows[0]["forecasts"]["timesfm"]["6m"].is_number());

    let records: Vec<ForecastRecord> = serde_json::from_value(raw).expect("records");
    assert_eq!(records[0].forecasts["chronos"].len(), 5);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forecast_all_requires_market_data_snapshot() {
    let settings = ForecastSettings::default();
    let missing = std::env::temp_dir().join(format!("forecaster-missing-{}.bin", Uuid::new_v4()));
    let err = forecast_all::run(&settings, ExecutionContext::cpu().expect("cpu"), &missing, &[], None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("import-closes"), "{err}");
}
