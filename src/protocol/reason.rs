//! MQTT v5.0 reason codes

use std::fmt;

macro_rules! reason_codes {
    ($( $name:ident = $value:literal, $text:literal; )+) => {
        /// MQTT v5.0 reason code, shared by CONNACK, PUBACK/PUBREC/PUBREL/
        /// PUBCOMP, SUBACK, UNSUBACK, DISCONNECT and AUTH.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(u8)]
        pub enum ReasonCode {
            #[default]
            $( $name = $value, )+
        }

        impl ReasonCode {
            pub fn from_u8(v: u8) -> Option<Self> {
                match v {
                    $( $value => Some(ReasonCode::$name), )+
                    _ => None,
                }
            }
        }

        impl fmt::Display for ReasonCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $( ReasonCode::$name => f.write_str($text), )+
                }
            }
        }
    };
}

reason_codes! {
    Success = 0x00, "success";
    GrantedQoS1 = 0x01, "granted QoS 1";
    GrantedQoS2 = 0x02, "granted QoS 2";
    DisconnectWithWill = 0x04, "disconnect with will message";
    NoMatchingSubscribers = 0x10, "no matching subscribers";
    NoSubscriptionExisted = 0x11, "no subscription existed";
    ContinueAuthentication = 0x18, "continue authentication";
    ReAuthenticate = 0x19, "re-authenticate";
    UnspecifiedError = 0x80, "unspecified error";
    MalformedPacket = 0x81, "malformed packet";
    ProtocolError = 0x82, "protocol error";
    ImplementationError = 0x83, "implementation specific error";
    UnsupportedProtocolVersion = 0x84, "unsupported protocol version";
    ClientIdNotValid = 0x85, "client identifier not valid";
    BadUserNameOrPassword = 0x86, "bad user name or password";
    NotAuthorized = 0x87, "not authorized";
    ServerUnavailable = 0x88, "server unavailable";
    ServerBusy = 0x89, "server busy";
    Banned = 0x8A, "banned";
    ServerShuttingDown = 0x8B, "server shutting down";
    BadAuthenticationMethod = 0x8C, "bad authentication method";
    KeepAliveTimeout = 0x8D, "keep alive timeout";
    SessionTakenOver = 0x8E, "session taken over";
    TopicFilterInvalid = 0x8F, "topic filter invalid";
    TopicNameInvalid = 0x90, "topic name invalid";
    PacketIdInUse = 0x91, "packet identifier in use";
    PacketIdNotFound = 0x92, "packet identifier not found";
    ReceiveMaxExceeded = 0x93, "receive maximum exceeded";
    TopicAliasInvalid = 0x94, "topic alias invalid";
    PacketTooLarge = 0x95, "packet too large";
    MessageRateTooHigh = 0x96, "message rate too high";
    QuotaExceeded = 0x97, "quota exceeded";
    AdministrativeAction = 0x98, "administrative action";
    PayloadFormatInvalid = 0x99, "payload format invalid";
    RetainNotSupported = 0x9A, "retain not supported";
    QoSNotSupported = 0x9B, "QoS not supported";
    UseAnotherServer = 0x9C, "use another server";
    ServerMoved = 0x9D, "server moved";
    SharedSubsNotSupported = 0x9E, "shared subscriptions not supported";
    ConnectionRateExceeded = 0x9F, "connection rate exceeded";
    MaximumConnectTime = 0xA0, "maximum connect time";
    SubIdsNotSupported = 0xA1, "subscription identifiers not supported";
    WildcardSubsNotSupported = 0xA2, "wildcard subscriptions not supported";
}

impl ReasonCode {
    /// Codes below 0x80 are successful outcomes.
    #[inline]
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }

    #[inline]
    pub fn is_error(self) -> bool {
        !self.is_success()
    }

    /// Map onto the v3.1.1 CONNACK return-code space.
    pub fn to_v3_connack_code(self) -> u8 {
        match self {
            ReasonCode::Success => 0x00,
            ReasonCode::UnsupportedProtocolVersion => 0x01,
            ReasonCode::ClientIdNotValid => 0x02,
            ReasonCode::ServerUnavailable | ReasonCode::ServerBusy => 0x03,
            ReasonCode::BadUserNameOrPassword => 0x04,
            _ => 0x05,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_known_codes() {
        for v in 0u8..=0xA2 {
            if let Some(code) = ReasonCode::from_u8(v) {
                assert_eq!(code as u8, v);
            }
        }
    }

    #[test]
    fn unknown_codes_rejected() {
        assert_eq!(ReasonCode::from_u8(0x03), None);
        assert_eq!(ReasonCode::from_u8(0x7F), None);
        assert_eq!(ReasonCode::from_u8(0xFF), None);
    }

    #[test]
    fn success_split_at_0x80() {
        assert!(ReasonCode::GrantedQoS2.is_success());
        assert!(ReasonCode::NoMatchingSubscribers.is_success());
        assert!(ReasonCode::UnspecifiedError.is_error());
        assert!(ReasonCode::QuotaExceeded.is_error());
    }

    #[test]
    fn v3_connack_mapping() {
        assert_eq!(ReasonCode::Success.to_v3_connack_code(), 0x00);
        assert_eq!(ReasonCode::ClientIdNotValid.to_v3_connack_code(), 0x02);
        assert_eq!(ReasonCode::NotAuthorized.to_v3_connack_code(), 0x05);
        assert_eq!(ReasonCode::QuotaExceeded.to_v3_connack_code(), 0x05);
    }
}
