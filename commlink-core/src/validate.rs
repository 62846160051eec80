//! Endpoint validation
//!
//! Malformed addresses and port names are rejected here, before they reach a
//! transport, so a bad configuration never causes any I/O.

use crate::error::{CommError, CommResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;

/// Serial device names: `COM<n>` on Windows, device nodes under `/dev` elsewhere
static SERIAL_PORT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(COM[1-9][0-9]*|/dev/(tty[A-Za-z0-9_.-]+|cu\.[A-Za-z0-9_.-]+|serial/by-(id|path)/[A-Za-z0-9_.:-]+))$")
        .expect("serial port pattern must compile")
});

/// Check whether `address` is a literal IPv4 or IPv6 address
pub fn verify_ip_address(address: &str) -> bool {
    address.trim().parse::<IpAddr>().is_ok()
}

/// Check whether `port` is a decimal TCP port in `1..=65535`
pub fn verify_tcp_port(port: &str) -> bool {
    parse_tcp_port(port).is_ok()
}

/// Check whether `port` names a serial device (`COM3`, `/dev/ttyUSB0`, ...)
pub fn verify_serial_port(port: &str) -> bool {
    SERIAL_PORT_PATTERN.is_match(port)
}

/// Parse an IP address literal
///
/// # Errors
/// Returns `CommError::InvalidAddress` carrying the rejected text.
pub fn parse_ip_address(address: &str) -> CommResult<IpAddr> {
    address
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| CommError::InvalidAddress(address.to_string()))
}

/// Parse a TCP port number
///
/// Port 0 is rejected: a transport always needs a concrete port to persist.
///
/// # Errors
/// Returns `CommError::InvalidPort` carrying the rejected text.
pub fn parse_tcp_port(port: &str) -> CommResult<u16> {
    match port.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(CommError::InvalidPort(port.to_string())),
        Ok(value) => Ok(value),
    }
}

/// Validate a serial device name, returning it unchanged
///
/// # Errors
/// Returns `CommError::InvalidPort` if the name is not a recognised device.
pub fn parse_serial_port(port: &str) -> CommResult<String> {
    if verify_serial_port(port) {
        Ok(port.to_string())
    } else {
        Err(CommError::InvalidPort(port.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_addresses() {
        assert!(verify_ip_address("127.0.0.1"));
        assert!(verify_ip_address("192.168.10.254"));
        assert!(verify_ip_address("::1"));
        assert!(!verify_ip_address("256.1.1.1"));
        assert!(!verify_ip_address("localhost"));
        assert!(!verify_ip_address(""));
    }

    #[test]
    fn test_tcp_ports() {
        assert!(verify_tcp_port("1"));
        assert!(verify_tcp_port("9009"));
        assert!(verify_tcp_port("65535"));
        assert!(!verify_tcp_port("0"));
        assert!(!verify_tcp_port("65536"));
        assert!(!verify_tcp_port("-1"));
        assert!(!verify_tcp_port("http"));
        assert_eq!(parse_tcp_port(" 4059 ").unwrap(), 4059);
    }

    #[test]
    fn test_serial_ports() {
        assert!(verify_serial_port("COM1"));
        assert!(verify_serial_port("COM12"));
        assert!(verify_serial_port("/dev/ttyUSB0"));
        assert!(verify_serial_port("/dev/ttyS1"));
        assert!(verify_serial_port("/dev/cu.usbserial-1410"));
        assert!(verify_serial_port("/dev/serial/by-id/usb-FTDI_FT232R-if00-port0"));
        assert!(!verify_serial_port("COM0"));
        assert!(!verify_serial_port("com1"));
        assert!(!verify_serial_port("/tmp/ttyUSB0"));
        assert!(!verify_serial_port(""));
    }

    #[test]
    fn test_serial_port_pattern_compiles() {
        assert!(SERIAL_PORT_PATTERN.is_match("COM3"));
        assert_eq!(parse_serial_port("COM3").unwrap(), "COM3");
    }

    #[test]
    fn test_parse_errors_carry_input() {
        match parse_ip_address("10.0.0") {
            Err(CommError::InvalidAddress(text)) => assert_eq!(text, "10.0.0"),
            other => panic!("unexpected result: {:?}", other),
        }
        match parse_serial_port("LPT1") {
            Err(CommError::InvalidPort(text)) => assert_eq!(text, "LPT1"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
