// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::event::EventPayload;
use crate::session::SessionState;

fn feed_str(parser: &mut LineParser, s: &str) -> Vec<Event> {
    parser.feed(s.as_bytes())
}

#[test]
fn output_line() {
    let mut parser = LineParser::new(1024);
    let events = feed_str(&mut parser, "{\"type\":\"output\",\"content\":\"hello\"}\n");
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0].payload,
        EventPayload::Output { content } if content == "hello"
    ));
}

#[test]
fn status_line_tracks_previous_state() {
    let mut parser = LineParser::new(1024);
    let events = feed_str(&mut parser, "{\"type\":\"status\",\"state\":\"idle\"}\n");
    assert!(matches!(
        &events[0].payload,
        EventPayload::StatusChange {
            old_state: SessionState::Running,
            new_state: SessionState::Idle,
            reason: None,
        }
    ));

    let events =
        feed_str(&mut parser, "{\"type\":\"status\",\"state\":\"running\",\"reason\":\"work\"}\n");
    assert!(matches!(
        &events[0].payload,
        EventPayload::StatusChange {
            old_state: SessionState::Idle,
            new_state: SessionState::Running,
            reason: Some(reason),
        } if reason == "work"
    ));
}

#[test]
fn metric_and_metadata_lines() {
    let mut parser = LineParser::new(1024);
    let events = feed_str(
        &mut parser,
        "{\"type\":\"metric\",\"tokens_in\":3,\"tokens_out\":7,\"request_count\":1}\n\
         {\"type\":\"metadata\",\"key\":\"task\",\"value\":\"review\"}\n",
    );
    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[0].payload,
        EventPayload::Metric { tokens_in: 3, tokens_out: 7, request_count: 1 }
    ));
    assert!(matches!(
        &events[1].payload,
        EventPayload::Metadata { key, value } if key == "task" && value == "review"
    ));
}

#[test]
fn error_line_with_code() {
    let mut parser = LineParser::new(1024);
    let events =
        feed_str(&mut parser, "{\"type\":\"error\",\"message\":\"quota\",\"code\":\"rate\"}\n");
    assert!(matches!(
        &events[0].payload,
        EventPayload::Error { message, code: Some(code) } if message == "quota" && code == "rate"
    ));
    assert!(!events[0].is_fatal());
}

#[test]
fn malformed_line_degrades_to_error_event() {
    let mut parser = LineParser::new(1024);
    let events = feed_str(&mut parser, "not json at all\n{\"type\":\"output\",\"content\":\"ok\"}\n");
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0].payload,
        EventPayload::Error { code: Some(code), .. } if code == "parse"
    ));
    assert!(events[1].is_output());
}

#[test]
fn unknown_type_and_missing_type() {
    let mut parser = LineParser::new(1024);
    let events = feed_str(&mut parser, "{\"type\":\"mystery\"}\n{\"content\":\"x\"}\n");
    assert_eq!(events.len(), 2);
    for event in &events {
        assert!(matches!(
            &event.payload,
            EventPayload::Error { code: Some(code), .. } if code == "parse"
        ));
    }
}

#[test]
fn unknown_state_is_a_parse_error() {
    let mut parser = LineParser::new(1024);
    let events = feed_str(&mut parser, "{\"type\":\"status\",\"state\":\"zombie\"}\n");
    assert!(matches!(&events[0].payload, EventPayload::Error { .. }));
}

#[test]
fn lines_split_across_chunks_reassemble() {
    let mut parser = LineParser::new(1024);
    assert!(feed_str(&mut parser, "{\"type\":\"outp").is_empty());
    assert!(feed_str(&mut parser, "ut\",\"content\":\"split\"").is_empty());
    let events = feed_str(&mut parser, "}\n");
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0].payload,
        EventPayload::Output { content } if content == "split"
    ));
}

#[test]
fn oversized_line_is_dropped_and_stream_continues() {
    let mut parser = LineParser::new(16);
    let big = "x".repeat(64);
    let mut events = feed_str(&mut parser, &format!("{big}"));
    assert!(events.is_empty());
    events = feed_str(&mut parser, "more of the same line\n{\"type\":\"output\",\"content\":\"a\"}\n");
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0].payload,
        EventPayload::Error { code: Some(code), .. } if code == "line_too_long"
    ));
    assert!(events[1].is_output());
}

#[test]
fn blank_lines_are_skipped() {
    let mut parser = LineParser::new(1024);
    let events = feed_str(&mut parser, "\n  \n{\"type\":\"output\",\"content\":\"a\"}\n");
    assert_eq!(events.len(), 1);
}

#[test]
fn finish_flushes_partial_line() {
    let mut parser = LineParser::new(1024);
    assert!(feed_str(&mut parser, "{\"type\":\"output\",\"content\":\"tail\"}").is_empty());
    let event = parser.finish();
    assert!(event.is_some_and(|e| e.is_output()));
    assert!(parser.finish().is_none());
}

#[test]
fn finish_reports_oversized_partial() {
    let mut parser = LineParser::new(4);
    assert!(feed_str(&mut parser, "oversized partial").is_empty());
    let event = parser.finish();
    assert!(event.is_some_and(|e| matches!(
        &e.payload,
        EventPayload::Error { code: Some(code), .. } if code == "line_too_long"
    )));
}

#[test]
fn encode_input_is_one_json_document() -> anyhow::Result<()> {
    let line = encode_input("run the tests\n");
    let value: serde_json::Value = serde_json::from_str(&line)?;
    assert_eq!(value["type"], "input");
    assert_eq!(value["text"], "run the tests\n");
    Ok(())
}
