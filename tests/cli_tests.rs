mod common;
use common::*;

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Write;
use tempfile::TempDir;

fn sample_log() -> String {
    [BENIGN_LINE, SQLI_LINE, TRAVERSAL_LINE].join("\n") + "\n"
}

#[test]
fn scores_stdin_as_json_lines() {
    let (stdout, stderr, exit_code) = run_reqscore_with_input(&[], &sample_log());

    assert_eq!(exit_code, 0, "stderr: {}", stderr);
    let responses = parse_json_lines(&stdout);
    assert_eq!(responses.len(), 3);

    assert_eq!(responses[0]["is_anomalous"], false);
    assert_eq!(responses[1]["is_anomalous"], true);
    assert_eq!(responses[2]["is_anomalous"], true);
    assert_eq!(responses[1]["features"]["contains_sql_keywords"], true);
    for response in &responses {
        assert!(response["request_id"].as_str().unwrap().starts_with("req_"));
        assert!(response["template_id"].is_u64());
    }
}

#[test]
fn output_preserves_input_order_across_batches() {
    let input: String = (0..200)
        .map(|i| {
            if i % 10 == 0 {
                format!("{}\n", SQLI_LINE)
            } else {
                format!("{}\n", BENIGN_LINE)
            }
        })
        .collect();

    let (stdout, _stderr, exit_code) = run_reqscore_with_input(&["--batch-size", "7"], &input);
    assert_eq!(exit_code, 0);

    let responses = parse_json_lines(&stdout);
    assert_eq!(responses.len(), 200);
    for (i, response) in responses.iter().enumerate() {
        assert_eq!(response["is_anomalous"], i % 10 == 0, "line {}", i + 1);
    }
}

#[test]
fn unparseable_lines_are_summarized_not_fatal() {
    let input = format!("{}\nthis is not a log line\n\n{}\n", BENIGN_LINE, SQLI_LINE);
    let (stdout, stderr, exit_code) = run_reqscore_with_input(&[], &input);

    assert_eq!(exit_code, 0);
    assert_eq!(parse_json_lines(&stdout).len(), 2);
    assert!(stderr.contains("2 lines accepted, 1 lines could not be parsed"), "stderr: {}", stderr);
    assert!(stderr.contains("\"parse\""));
    assert!(stderr.contains("<stdin>:2"));
}

#[test]
fn invalid_utf8_does_not_stop_the_stream() {
    let raw_bytes_request: &[u8] = b"198.51.100.9 - - [23/Sep/2025:10:30:03 +0000] \"GET /search?q=\xff\xfe HTTP/1.1\" 200 12 \"-\" \"Mozilla/5.0\"";

    let mut input = Vec::new();
    input.extend_from_slice(BENIGN_LINE.as_bytes());
    input.push(b'\n');
    input.extend_from_slice(b"\xff\xfe\x80 binary noise\n");
    for line in [SQLI_LINE, BENIGN_LINE] {
        input.extend_from_slice(line.as_bytes());
        input.push(b'\n');
    }
    input.extend_from_slice(raw_bytes_request);
    input.push(b'\n');
    input.extend_from_slice(TRAVERSAL_LINE.as_bytes());
    input.push(b'\n');

    let (stdout, stderr, exit_code) = run_reqscore_with_bytes(&[], &input);

    assert_eq!(exit_code, 0, "stderr: {}", stderr);
    let responses = parse_json_lines(&stdout);
    assert_eq!(responses.len(), 5, "stderr: {}", stderr);
    assert_eq!(responses[1]["is_anomalous"], true);
    assert_eq!(responses[4]["is_anomalous"], true);
    assert!(stderr.contains("5 lines accepted, 1 lines could not be parsed"), "stderr: {}", stderr);
    assert!(stderr.contains("<stdin>:2"));
    assert!(!stderr.contains("valid UTF-8"));
}

#[test]
fn diagnostics_have_no_color_codes_when_captured() {
    let (_stdout, stderr, exit_code) =
        run_reqscore_with_input(&["-v"], &format!("{}\nnot a log line\n", BENIGN_LINE));

    assert_eq!(exit_code, 0);
    assert!(stderr.contains("line rejected"), "stderr: {}", stderr);
    assert!(!stderr.contains('\u{1b}'), "stderr: {:?}", stderr);
}

#[test]
fn stats_table_goes_to_stderr() {
    let (stdout, stderr, exit_code) = run_reqscore_with_input(&["--stats", "-q"], &sample_log());

    assert_eq!(exit_code, 0);
    assert!(stdout.trim().is_empty(), "quiet mode printed: {}", stdout);
    assert!(stderr.contains("Requests: 3 total, 2 anomalous (66.7%)"), "stderr: {}", stderr);
    assert!(stderr.contains("Batches:"));
}

#[test]
fn stats_json_is_parseable() {
    let (_stdout, stderr, exit_code) =
        run_reqscore_with_input(&["--stats=json", "-q"], &sample_log());

    assert_eq!(exit_code, 0);
    let start = stderr.find('{').expect("stats JSON on stderr");
    let stats: serde_json::Value = serde_json::from_str(stderr[start..].trim()).unwrap();
    assert_eq!(stats["total_requests"], 3);
    assert_eq!(stats["anomalous_requests"], 2);
    assert_eq!(stats["failed_requests"], 0);
}

#[test]
fn templates_are_listed() {
    let input = [
        r#"10.0.0.1 - - [23/Sep/2025:10:30:00 +0000] "GET /api/users/42 HTTP/1.1" 200 10 "-" "Mozilla/5.0""#,
        r#"10.0.0.2 - - [23/Sep/2025:10:30:01 +0000] "GET /api/users/99 HTTP/1.1" 200 10 "-" "Mozilla/5.0""#,
    ]
    .join("\n");

    let (stdout, stderr, exit_code) = run_reqscore_with_input(&["--templates"], &input);
    assert_eq!(exit_code, 0);

    let responses = parse_json_lines(&stdout);
    assert_eq!(responses[0]["template_id"], responses[1]["template_id"]);
    assert!(stderr.contains("/api/users/<NUM>"), "stderr: {}", stderr);
}

#[test]
fn reads_plain_and_gzip_files() {
    let temp_dir = TempDir::new().unwrap();
    let gz_path = temp_dir.path().join("access.log.gz");
    let mut encoder = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::default());
    encoder.write_all(sample_log().as_bytes()).unwrap();
    encoder.finish().unwrap();

    let plain_path = temp_dir.path().join("access.log");
    std::fs::write(&plain_path, format!("{}\n", BENIGN_LINE)).unwrap();

    let (stdout, stderr, exit_code) = run_reqscore_with_files(
        &[],
        &[gz_path.to_str().unwrap(), plain_path.to_str().unwrap()],
    );

    assert_eq!(exit_code, 0, "stderr: {}", stderr);
    let responses = parse_json_lines(&stdout);
    assert_eq!(responses.len(), 4);
    assert_eq!(responses[1]["is_anomalous"], true);
    assert_eq!(responses[3]["is_anomalous"], false);
}

#[test]
fn missing_file_is_an_error_but_other_files_are_scored() {
    let (stdout, stderr, exit_code) = run_reqscore_with_file(&[], &sample_log());
    assert_eq!(exit_code, 0, "stderr: {}", stderr);
    assert_eq!(parse_json_lines(&stdout).len(), 3);

    let temp_dir = TempDir::new().unwrap();
    let present = temp_dir.path().join("present.log");
    std::fs::write(&present, sample_log()).unwrap();
    let (stdout, stderr, exit_code) = run_reqscore_with_files(
        &[],
        &["/nonexistent/missing.log", present.to_str().unwrap()],
    );

    assert_eq!(exit_code, 1);
    assert_eq!(parse_json_lines(&stdout).len(), 3);
    assert!(stderr.contains("missing.log"), "stderr: {}", stderr);
}

#[test]
fn threshold_controls_the_anomaly_flag() {
    let (stdout, _stderr, exit_code) =
        run_reqscore_with_input(&["--threshold", "0.9"], &sample_log());
    assert_eq!(exit_code, 0);

    let responses = parse_json_lines(&stdout);
    assert_eq!(responses[1]["is_anomalous"], false);
    assert!(responses[1]["anomaly_score"].as_f64().unwrap() > 0.5);
}

#[test]
fn invalid_configuration_exits_with_usage_error() {
    let (_stdout, stderr, exit_code) = run_reqscore_with_input(&["--batch-size", "0"], "");
    assert_eq!(exit_code, 2);
    assert!(stderr.contains("max_batch_size"), "stderr: {}", stderr);

    let (_stdout, _stderr, exit_code) = run_reqscore_with_input(&["--threshold", "7"], "");
    assert_eq!(exit_code, 2);

    let (_stdout, stderr, exit_code) = run_reqscore_with_input(&["--max-length", "2"], "");
    assert_eq!(exit_code, 2);
    assert!(stderr.contains("max_length"));
}

#[test]
fn empty_input_succeeds_quietly() {
    let (stdout, stderr, exit_code) = run_reqscore_with_input(&[], "");
    assert_eq!(exit_code, 0);
    assert!(stdout.is_empty());
    assert!(!stderr.contains("could not be parsed"));
}
