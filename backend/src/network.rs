//! Bridge and NAT plumbing for guest networking.
//!
//! Every VM gets a TAP interface enslaved to one bridge; the bridge owns the
//! gateway address and a masquerade rule gives guests outbound connectivity.
//! Both operations are idempotent so the backend can run them on every
//! start.

use std::env;
use std::net::Ipv4Addr;

use futures_util::stream::TryStreamExt;
use nftables::{
    batch::Batch,
    expr::{Expression, NamedExpression, Payload, PayloadField, Prefix},
    helper, schema,
    stmt::{Match, Operator, Statement},
    types,
};
use rtnetlink::{Handle, LinkBridge, LinkUnspec, new_connection, packet_route::link::LinkMessage};
use thiserror::Error;
use tracing::info;

const DEFAULT_BRIDGE_NAME: &str = "cloudebr0";
const DEFAULT_BRIDGE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 39, 39);
const BRIDGE_PREFIX_LEN: u8 = 24;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid bridge IP address {value:?}")]
    InvalidBridgeIp {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("failed to open a netlink connection")]
    Connection(#[source] std::io::Error),

    #[error("netlink request failed")]
    Netlink(#[from] rtnetlink::Error),

    #[error("bridge {name} not found after creation")]
    BridgeVanished { name: String },

    #[error("nftables operation failed")]
    Nftables(#[from] nftables::helper::NftablesError),
}

/// Bridge parameters, taken from `BRIDGE_NAME` / `BRIDGE_IP` with defaults.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub bridge_name: String,
    pub bridge_ip: Ipv4Addr,
    pub prefix_len: u8,
}

impl NetworkConfig {
    pub fn from_env() -> Result<Self, NetworkError> {
        let bridge_name =
            env::var("BRIDGE_NAME").unwrap_or_else(|_| DEFAULT_BRIDGE_NAME.to_string());
        let bridge_ip = match env::var("BRIDGE_IP") {
            Ok(value) => value
                .parse()
                .map_err(|source| NetworkError::InvalidBridgeIp { value, source })?,
            Err(_) => DEFAULT_BRIDGE_IP,
        };

        Ok(Self {
            bridge_name,
            bridge_ip,
            prefix_len: BRIDGE_PREFIX_LEN,
        })
    }

    /// Network address of the bridge subnet, e.g. `192.168.39.0`.
    pub fn subnet(&self) -> String {
        let masked =
            u32::from(self.bridge_ip) & (u32::MAX << (32 - u32::from(self.prefix_len)));
        Ipv4Addr::from(masked).to_string()
    }
}

/// Create the bridge if needed, give it the gateway address, bring it up.
pub async fn setup_bridge(config: &NetworkConfig) -> Result<(), NetworkError> {
    let (connection, handle, _) = new_connection().map_err(NetworkError::Connection)?;
    tokio::spawn(connection);

    info!(bridge = %config.bridge_name, "checking for existing bridge");
    let link_index = match get_link_by_name(&handle, &config.bridge_name).await? {
        Some(link) => {
            info!(
                bridge = %config.bridge_name,
                index = link.header.index,
                "bridge already exists"
            );
            link.header.index
        }
        None => {
            info!(bridge = %config.bridge_name, "creating bridge");
            create_bridge(&handle, &config.bridge_name).await?
        }
    };

    info!(ip = %config.bridge_ip, "assigning gateway address");
    match handle
        .address()
        .add(link_index, config.bridge_ip.into(), config.prefix_len)
        .execute()
        .await
    {
        Ok(_) => {}
        // EEXIST means the address is already configured, which is fine.
        Err(e) if e.to_string().contains("File exists") => {
            info!("gateway address already present");
        }
        Err(e) => return Err(e.into()),
    }

    handle
        .link()
        .set(LinkUnspec::new_with_index(link_index).up().build())
        .execute()
        .await?;

    info!(bridge = %config.bridge_name, "bridge ready");
    Ok(())
}

async fn get_link_by_name(
    handle: &Handle,
    name: &str,
) -> Result<Option<LinkMessage>, rtnetlink::Error> {
    let mut links = handle.link().get().execute();
    while let Some(link) = links.try_next().await? {
        let link_name = link.attributes.iter().find_map(|attr| {
            if let rtnetlink::packet_route::link::LinkAttribute::IfName(n) = attr {
                Some(n.as_str())
            } else {
                None
            }
        });
        if link_name == Some(name) {
            return Ok(Some(link));
        }
    }

    Ok(None)
}

async fn create_bridge(handle: &Handle, name: &str) -> Result<u32, NetworkError> {
    handle
        .link()
        .add(LinkBridge::new(name).build())
        .execute()
        .await?;

    let link = get_link_by_name(handle, name)
        .await?
        .ok_or_else(|| NetworkError::BridgeVanished {
            name: name.to_string(),
        })?;

    info!(bridge = name, index = link.header.index, "bridge created");
    Ok(link.header.index)
}

/// The POSTROUTING masquerade rule for the bridge subnet.
fn masquerade_rule(subnet: &str) -> schema::Rule<'static> {
    schema::Rule {
        family: types::NfFamily::IP,
        table: "nat".into(),
        chain: "POSTROUTING".into(),
        expr: vec![
            Statement::Match(Match {
                left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(
                    PayloadField {
                        protocol: "ip".into(),
                        field: "saddr".into(),
                    },
                ))),
                right: Expression::Named(NamedExpression::Prefix(Prefix {
                    addr: Box::new(Expression::String(subnet.to_string().into())),
                    len: u32::from(BRIDGE_PREFIX_LEN),
                })),
                op: Operator::EQ,
            }),
            Statement::Masquerade(None),
        ]
        .into(),
        ..Default::default()
    }
}

/// Does the ruleset already contain our masquerade rule for `subnet`?
fn ruleset_has_masquerade(ruleset: &schema::Nftables<'_>, subnet: &str) -> bool {
    ruleset.objects.iter().any(|object| match object {
        schema::NfObject::ListObject(schema::NfListObject::Rule(rule))
            if rule.family == types::NfFamily::IP
                && rule.table == "nat"
                && rule.chain == "POSTROUTING" =>
        {
            let mut has_subnet_match = false;
            let mut has_masquerade = false;

            for stmt in rule.expr.iter() {
                match stmt {
                    Statement::Match(m) => {
                        if let Expression::Named(NamedExpression::Prefix(prefix)) = &m.right {
                            if let Expression::String(addr) = &*prefix.addr {
                                if addr.as_ref() == subnet
                                    && prefix.len == u32::from(BRIDGE_PREFIX_LEN)
                                {
                                    has_subnet_match = true;
                                }
                            }
                        }
                    }
                    Statement::Masquerade(_) => has_masquerade = true,
                    _ => {}
                }
            }

            has_subnet_match && has_masquerade
        }
        _ => false,
    })
}

/// Install the NAT table, chain and masquerade rule, unless an equivalent
/// rule is already present.
pub fn setup_nat(config: &NetworkConfig) -> Result<(), NetworkError> {
    let subnet = config.subnet();

    let current = helper::get_current_ruleset()?;
    if ruleset_has_masquerade(&current, &subnet) {
        info!(subnet = %subnet, "NAT rules already present, skipping");
        return Ok(());
    }

    info!(subnet = %subnet, "installing NAT rules");
    let mut batch = Batch::new();

    batch.add(schema::NfListObject::Table(schema::Table {
        family: types::NfFamily::IP,
        name: "nat".into(),
        ..Default::default()
    }));

    batch.add(schema::NfListObject::Chain(schema::Chain {
        family: types::NfFamily::IP,
        table: "nat".into(),
        name: "POSTROUTING".into(),
        _type: Some(types::NfChainType::NAT),
        hook: Some(types::NfHook::Postrouting),
        prio: Some(1),
        policy: Some(types::NfChainPolicy::Accept),
        ..Default::default()
    }));

    batch.add(schema::NfListObject::Rule(masquerade_rule(&subnet)));

    helper::apply_ruleset(&batch.to_nftables())?;
    info!("NAT rules installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            bridge_name: "cloudebr0".into(),
            bridge_ip: Ipv4Addr::new(192, 168, 39, 39),
            prefix_len: 24,
        }
    }

    #[test]
    fn subnet_masks_the_host_bits() {
        assert_eq!(test_config().subnet(), "192.168.39.0");

        let other = NetworkConfig {
            bridge_ip: Ipv4Addr::new(10, 1, 2, 200),
            ..test_config()
        };
        assert_eq!(other.subnet(), "10.1.2.0");
    }

    #[test]
    fn masquerade_rule_matches_its_own_detector() {
        let rule = masquerade_rule("192.168.39.0");
        let ruleset = schema::Nftables {
            objects: vec![schema::NfObject::ListObject(schema::NfListObject::Rule(
                rule,
            ))]
            .into(),
        };

        assert!(ruleset_has_masquerade(&ruleset, "192.168.39.0"));
        // A different subnet must not be treated as covered.
        assert!(!ruleset_has_masquerade(&ruleset, "10.0.0.0"));
    }

    #[test]
    fn unrelated_rules_are_not_detected_as_masquerade() {
        let rule = schema::Rule {
            family: types::NfFamily::IP,
            table: "filter".into(),
            chain: "INPUT".into(),
            ..Default::default()
        };
        let ruleset = schema::Nftables {
            objects: vec![schema::NfObject::ListObject(schema::NfListObject::Rule(
                rule,
            ))]
            .into(),
        };

        assert!(!ruleset_has_masquerade(&ruleset, "192.168.39.0"));
    }

    #[test]
    fn empty_ruleset_has_no_masquerade() {
        let ruleset = schema::Nftables {
            objects: Vec::new().into(),
        };
        assert!(!ruleset_has_masquerade(&ruleset, "192.168.39.0"));
    }
}
