// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Settings
//!
//! Connection parameters for the RabbitMQ server, usually deserialized from the
//! application's configuration source.

use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;

/// TLS parameters for `amqps://` connections.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsConfigs {
    /// PEM encoded CA chain used to verify the server certificate. The system
    /// roots are used when absent.
    pub ca_cert_chain: Option<String>,
}

/// RabbitMQ connection settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Name reported to the broker for the connection.
    pub connection_name: String,
    pub tls: Option<TlsConfigs>,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "resilient-rabbitmq".to_owned(),
            tls: None,
        }
    }
}

impl RabbitMQConfigs {
    /// Builds the broker address from these settings.
    ///
    /// The address is kept structured rather than formatted into a URI
    /// string, so credentials and virtual hosts containing reserved
    /// characters such as `@`, `:` or `/` reach the broker verbatim.
    ///
    /// # Returns
    /// An `amqps` address when TLS is configured, `amqp` otherwise
    pub fn amqp_uri(&self) -> AMQPUri {
        let scheme = if self.tls.is_some() {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        };

        AMQPUri {
            scheme,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..AMQPUri::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_a_local_broker() {
        let uri = RabbitMQConfigs::default().amqp_uri();

        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.authority.userinfo.username, "guest");
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn tls_switches_the_scheme() {
        let cfg = RabbitMQConfigs {
            host: "broker.internal".to_owned(),
            port: 5671,
            vhost: "orders".to_owned(),
            tls: Some(TlsConfigs::default()),
            ..RabbitMQConfigs::default()
        };

        let uri = cfg.amqp_uri();
        assert_eq!(uri.scheme, AMQPScheme::AMQPS);
        assert_eq!(uri.authority.host, "broker.internal");
        assert_eq!(uri.authority.port, 5671);
        assert_eq!(uri.vhost, "orders");
    }

    #[test]
    fn reserved_characters_in_credentials_are_kept_verbatim() {
        let cfg = RabbitMQConfigs {
            user: "svc:billing".to_owned(),
            password: "p@ss/w:rd".to_owned(),
            vhost: "/tenants/acme".to_owned(),
            ..RabbitMQConfigs::default()
        };

        let uri = cfg.amqp_uri();
        assert_eq!(uri.authority.userinfo.username, "svc:billing");
        assert_eq!(uri.authority.userinfo.password, "p@ss/w:rd");
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.vhost, "/tenants/acme");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: RabbitMQConfigs =
            serde_json::from_str(r#"{ "host": "rabbit", "tls": { } }"#).unwrap();

        assert_eq!(cfg.host, "rabbit");
        assert_eq!(cfg.port, 5672);
        assert_eq!(cfg.tls, Some(TlsConfigs { ca_cert_chain: None }));
    }
}
