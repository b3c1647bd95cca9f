//! Generate wire test vectors for server-side interop testing.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::messages::*;

fn main() {
    let params = JoinParams {
        token: "test-token".to_string(),
        client: "atom".to_string(),
    };

    // Test vector 1: Join request
    let join = PhoenixMessage::join("session:ada:home", params.to_payload(), "1");
    print_test_vector("join", &join);

    // Test vector 2: Keystrokes
    let input = PhoenixMessage::new(
        "session:ada:home",
        events::TERMINAL_INPUT,
        TerminalInput::from_bytes("ls\r").to_payload(),
        Some("2".to_string()),
        Some("1".to_string()),
    );
    print_test_vector("terminal_input", &input);

    // Test vector 3: Clear (empty input)
    let clear = PhoenixMessage::new(
        "session:ada:home",
        events::TERMINAL_INPUT,
        TerminalInput::from_bytes("").to_payload(),
        Some("3".to_string()),
        Some("1".to_string()),
    );
    print_test_vector("terminal_clear", &clear);

    // Test vector 4: Output with an escape sequence and a non-UTF-8 byte
    let output = PhoenixMessage::new(
        "session:ada:home",
        events::TERMINAL_OUTPUT,
        TerminalOutput::from_bytes(b"\x1b[32mok\x1b[0m\xff\r\n").to_payload(),
        None,
        None,
    );
    print_test_vector("terminal_output", &output);

    // Test vector 5: Heartbeat
    print_test_vector("heartbeat", &PhoenixMessage::heartbeat("4"));

    // Test vector 6: Leave
    let leave = PhoenixMessage::leave("session:ada:home", "5", Some("1".to_string()));
    print_test_vector("leave", &leave);
}

fn print_test_vector(name: &str, message: &PhoenixMessage) {
    let json = message.to_json().expect("serialization failed");
    println!("{} = {}", name, json);
}
