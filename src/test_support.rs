//! Shared fixtures for client tests: a one-shot HTTP responder and a sample message.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};

use crate::message::{
    ImageMetadata, ModelMetadata, ResultMessage, ResultMetadata, SourceMetadata, WireDetections,
};
use crate::transport::Substitutions;

#[derive(Debug, Default)]
pub struct CapturedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Serve one connection per canned `(status, body)` reply, then stop.
///
/// Returns the base URL and a handle yielding the captured requests.
pub fn serve(replies: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<CapturedRequest>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let handle = thread::spawn(move || {
        let mut captured = Vec::new();
        for (status, reply) in replies {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut request = CapturedRequest::default();
            reader.read_line(&mut request.request_line).unwrap();
            request.request_line = request.request_line.trim_end().to_string();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    request
                        .headers
                        .push((name.trim().to_string(), value.trim().to_string()));
                }
            }
            let content_length = request
                .header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).unwrap();
            request.body = String::from_utf8(body).unwrap();
            captured.push(request);

            let mut stream = reader.into_inner();
            write!(
                stream,
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                reply.len(),
                reply
            )
            .unwrap();
        }
        captured
    });
    (url, handle)
}

/// A minimal result message with no detections.
pub fn sample_message() -> ResultMessage {
    let model = ModelMetadata {
        confidence_threshold: 0.25,
        iou_threshold: 0.45,
        margin: 40,
        multi_label: false,
        multi_label_iou_threshold: 0.5,
        model_name: "m.onnx".into(),
        max_det: 10,
        augment: false,
        inference_times: vec![],
    };
    ResultMessage {
        detections: WireDetections {
            flowers: vec![],
            pollinators: vec![],
        },
        metadata: ResultMetadata {
            flower_inference: model.clone(),
            pollinator_inference: model,
            original_image: ImageMetadata { size: [10, 10] },
            source: SourceMetadata {
                node_id: "nodeA".into(),
                timestamp: "2023-05-01T10:00:00Z".into(),
            },
        },
    }
}

pub fn sample_vars() -> Substitutions<'static> {
    Substitutions {
        filename: "nodeA_2023-05-01T10-00-00Z.json",
        node_id: "nodeA",
        hostname: "edge-01",
    }
}
