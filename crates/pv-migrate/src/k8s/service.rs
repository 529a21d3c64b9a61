//! Address acquisition for sshd services.

use std::net::Ipv6Addr;
use std::pin::pin;
use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Api, ListParams};
use kube::runtime::{WatchStreamExt, watcher};
use tracing::{debug, info};

use super::client::ClusterClient;
use crate::error::{MigrateError, MigrateResult};

/// Port sshd listens on inside its pod.
pub const SSH_PORT: u16 = 22;

const SSH_PORT_NAME: &str = "ssh";

/// DNS name of a service inside the cluster.
#[must_use]
pub fn cluster_dns_name(service: &str, namespace: &str) -> String {
    format!("{service}.{namespace}")
}

/// Brackets IPv6 literals so they can be embedded in an SSH endpoint.
#[must_use]
pub fn format_ssh_target_host(host: &str) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// The first load balancer ingress address, hostname preferred over IP.
#[must_use]
pub fn load_balancer_address(service: &Service) -> Option<String> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    ingress
        .hostname
        .as_deref()
        .filter(|h| !h.is_empty())
        .or_else(|| ingress.ip.as_deref().filter(|ip| !ip.is_empty()))
        .map(ToString::to_string)
}

/// The ssh node port of a `NodePort` service.
///
/// The port named `ssh` or serving port 22 wins, otherwise the first port with a
/// node port allocated.
#[must_use]
pub fn ssh_node_port(service: &Service) -> Option<u16> {
    let spec = service.spec.as_ref()?;
    if spec.type_.as_deref() != Some("NodePort") {
        return None;
    }
    let ports: Vec<_> = spec
        .ports
        .iter()
        .flatten()
        .filter(|p| p.node_port.is_some_and(|n| n > 0))
        .collect();
    let chosen = ports
        .iter()
        .find(|p| p.name.as_deref() == Some(SSH_PORT_NAME) || p.port == i32::from(SSH_PORT))
        .or_else(|| ports.first())?;
    chosen.node_port.and_then(|n| u16::try_from(n).ok())
}

/// Which node address type to try first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPreference {
    /// `InternalIP` first; used when both sides share a cluster.
    Internal,
    /// `ExternalIP` first; used across clusters.
    External,
}

impl AddressPreference {
    const fn order(self) -> [&'static str; 2] {
        match self {
            Self::Internal => ["InternalIP", "ExternalIP"],
            Self::External => ["ExternalIP", "InternalIP"],
        }
    }
}

/// An IP address of the node, in preference order. Hostname-only nodes yield `None`.
#[must_use]
pub fn node_address(node: &Node, preference: AddressPreference) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    preference.order().iter().find_map(|kind| {
        addresses
            .iter()
            .find(|a| a.type_ == *kind && !a.address.is_empty())
            .map(|a| a.address.clone())
    })
}

/// Picks a reachable node IP, trying the sshd pod's node first and then the rest.
#[must_use]
pub fn pick_node_ip(
    nodes: &[Node],
    preferred_node: Option<&str>,
    preference: AddressPreference,
) -> Option<String> {
    let preferred = preferred_node.and_then(|name| {
        nodes
            .iter()
            .find(|n| n.metadata.name.as_deref() == Some(name))
            .and_then(|n| node_address(n, preference))
    });
    preferred.or_else(|| nodes.iter().find_map(|n| node_address(n, preference)))
}

/// Watches a service until its load balancer publishes an address.
///
/// # Errors
///
/// Returns [`MigrateError::LbTimeout`] if no address appears within `timeout`.
pub async fn wait_for_load_balancer_address(
    client: &ClusterClient,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> MigrateResult<String> {
    let address = watch_service(client, namespace, name, timeout, load_balancer_address).await?;
    info!(namespace, service = name, %address, "load balancer address acquired");
    Ok(address)
}

/// Watches a service until it exposes an ssh node port.
///
/// # Errors
///
/// Returns [`MigrateError::LbTimeout`] if no node port appears within `timeout`.
pub async fn wait_for_node_port(
    client: &ClusterClient,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> MigrateResult<u16> {
    let port = watch_service(client, namespace, name, timeout, ssh_node_port).await?;
    info!(namespace, service = name, port, "node port acquired");
    Ok(port)
}

async fn watch_service<T>(
    client: &ClusterClient,
    namespace: &str,
    name: &str,
    timeout: Duration,
    extract: impl Fn(&Service) -> Option<T>,
) -> MigrateResult<T> {
    let services: Api<Service> = Api::namespaced(client.client(), namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));

    let watch = async {
        let mut stream = pin!(watcher(services, config).applied_objects());
        while let Some(service) = stream.try_next().await? {
            if let Some(found) = extract(&service) {
                return Ok(Some(found));
            }
            debug!(namespace, service = name, "service not ready yet");
        }
        Ok::<_, MigrateError>(None)
    };

    match tokio::time::timeout(timeout, watch).await {
        Ok(Ok(Some(found))) => Ok(found),
        Ok(Err(e)) => Err(e),
        Ok(Ok(None)) | Err(_) => Err(MigrateError::LbTimeout {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }),
    }
}

/// Finds a reachable node IP on the cluster.
///
/// # Errors
///
/// Returns [`MigrateError::NoNodeAddress`] if no node reports an internal or external
/// IP, or an API error.
pub async fn reachable_node_ip(
    client: &ClusterClient,
    preferred_node: Option<&str>,
    preference: AddressPreference,
) -> MigrateResult<String> {
    let nodes: Api<Node> = Api::all(client.client());
    let nodes = nodes.list(&ListParams::default()).await?;
    pick_node_ip(&nodes.items, preferred_node, preference).ok_or(MigrateError::NoNodeAddress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, NodeAddress, NodeStatus, ServicePort,
        ServiceSpec, ServiceStatus,
    };
    use kube::api::ObjectMeta;

    fn lb_service(ingress: Vec<LoadBalancerIngress>) -> Service {
        Service {
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(ingress),
                }),
                ..ServiceStatus::default()
            }),
            ..Service::default()
        }
    }

    fn ingress(ip: Option<&str>, hostname: Option<&str>) -> LoadBalancerIngress {
        LoadBalancerIngress {
            ip: ip.map(ToString::to_string),
            hostname: hostname.map(ToString::to_string),
            ..LoadBalancerIngress::default()
        }
    }

    fn port(name: Option<&str>, port: i32, node_port: Option<i32>) -> ServicePort {
        ServicePort {
            name: name.map(ToString::to_string),
            port,
            node_port,
            ..ServicePort::default()
        }
    }

    fn node_port_service(type_: &str, ports: Vec<ServicePort>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                ports: Some(ports),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    fn node(name: &str, addresses: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|(t, a)| NodeAddress {
                            type_: (*t).to_string(),
                            address: (*a).to_string(),
                        })
                        .collect(),
                ),
                ..NodeStatus::default()
            }),
            ..Node::default()
        }
    }

    mod load_balancer {
        use super::*;

        #[test]
        fn ip_address() {
            let svc = lb_service(vec![ingress(Some("203.0.113.5"), None)]);
            assert_eq!(load_balancer_address(&svc).as_deref(), Some("203.0.113.5"));
        }

        #[test]
        fn hostname_preferred_over_ip() {
            let svc = lb_service(vec![ingress(Some("203.0.113.5"), Some("lb.example.com"))]);
            assert_eq!(load_balancer_address(&svc).as_deref(), Some("lb.example.com"));
        }

        #[test]
        fn only_first_ingress_is_considered() {
            let svc = lb_service(vec![ingress(None, None), ingress(Some("10.0.0.1"), None)]);
            assert_eq!(load_balancer_address(&svc), None);
        }

        #[test]
        fn pending_service_has_no_address() {
            assert_eq!(load_balancer_address(&Service::default()), None);
            assert_eq!(load_balancer_address(&lb_service(vec![])), None);
        }

        #[tokio::test]
        async fn unreachable_api_times_out_or_errors() {
            let client = crate::k8s::client::test_support::offline_client(
                "http://127.0.0.1:1",
                None,
                None,
            );
            let result = wait_for_load_balancer_address(
                &client,
                "ns1",
                "svc",
                Duration::from_millis(200),
            )
            .await;
            assert!(matches!(
                result,
                Err(MigrateError::LbTimeout { .. } | MigrateError::Watch(_))
            ));
        }
    }

    mod ssh_target {
        use super::*;
        use test_case::test_case;

        #[test_case("203.0.113.5", "203.0.113.5" ; "ipv4")]
        #[test_case("lb.example.com", "lb.example.com" ; "hostname")]
        #[test_case("::1", "[::1]" ; "ipv6 loopback")]
        #[test_case("2001:db8::5", "[2001:db8::5]" ; "ipv6")]
        #[test_case("[::1]", "[::1]" ; "already bracketed")]
        fn bracketing(host: &str, expected: &str) {
            assert_eq!(format_ssh_target_host(host), expected);
        }

        mod proptest_tests {
            use super::*;
            use proptest::prelude::*;

            proptest! {
                #[test]
                fn brackets_iff_ipv6(segments in proptest::array::uniform8(any::<u16>())) {
                    let addr = Ipv6Addr::from(segments).to_string();
                    prop_assert_eq!(format_ssh_target_host(&addr), format!("[{addr}]"));
                }

                #[test]
                fn ipv4_and_names_pass_through(
                    octets in proptest::array::uniform4(any::<u8>()),
                    name in "[a-z][a-z0-9-]{0,20}(\\.[a-z]{2,6}){0,2}",
                ) {
                    let v4 = std::net::Ipv4Addr::from(octets).to_string();
                    prop_assert_eq!(format_ssh_target_host(&v4), v4.clone());
                    prop_assert_eq!(format_ssh_target_host(&name), name.clone());
                }
            }
        }
    }

    mod node_port {
        use super::*;

        #[test]
        fn named_ssh_port_wins() {
            let svc = node_port_service(
                "NodePort",
                vec![port(Some("http"), 80, Some(30080)), port(Some("ssh"), 2222, Some(31022))],
            );
            assert_eq!(ssh_node_port(&svc), Some(31022));
        }

        #[test]
        fn port_22_wins() {
            let svc = node_port_service(
                "NodePort",
                vec![port(None, 80, Some(30080)), port(None, 22, Some(32022))],
            );
            assert_eq!(ssh_node_port(&svc), Some(32022));
        }

        #[test]
        fn falls_back_to_first_port() {
            let svc = node_port_service("NodePort", vec![port(None, 80, Some(30080))]);
            assert_eq!(ssh_node_port(&svc), Some(30080));
        }

        #[test]
        fn unallocated_or_wrong_type_is_none() {
            let svc = node_port_service("NodePort", vec![port(Some("ssh"), 22, None)]);
            assert_eq!(ssh_node_port(&svc), None);
            let svc = node_port_service("ClusterIP", vec![port(Some("ssh"), 22, Some(30022))]);
            assert_eq!(ssh_node_port(&svc), None);
        }
    }

    mod node_ip {
        use super::*;
        use test_case::test_case;

        #[test]
        fn sshd_node_preferred() {
            let nodes = vec![
                node("a", &[("InternalIP", "10.0.0.1")]),
                node("b", &[("InternalIP", "10.0.0.2")]),
            ];
            assert_eq!(
                pick_node_ip(&nodes, Some("b"), AddressPreference::Internal).as_deref(),
                Some("10.0.0.2")
            );
        }

        #[test]
        fn hostname_only_node_scans_others() {
            let nodes = vec![
                node("a", &[("Hostname", "a.local")]),
                node("b", &[("ExternalIP", "198.51.100.7")]),
            ];
            assert_eq!(
                pick_node_ip(&nodes, Some("a"), AddressPreference::Internal).as_deref(),
                Some("198.51.100.7")
            );
        }

        #[test_case(AddressPreference::Internal, "10.0.0.1" ; "same cluster")]
        #[test_case(AddressPreference::External, "198.51.100.1" ; "cross cluster")]
        fn preference_orders_address_types(preference: AddressPreference, expected: &str) {
            let nodes = vec![node(
                "a",
                &[("ExternalIP", "198.51.100.1"), ("InternalIP", "10.0.0.1")],
            )];
            assert_eq!(pick_node_ip(&nodes, Some("a"), preference).as_deref(), Some(expected));
        }

        #[test]
        fn no_ip_anywhere() {
            let nodes = vec![node("a", &[("Hostname", "a.local")])];
            assert_eq!(pick_node_ip(&nodes, None, AddressPreference::External), None);
        }
    }

    #[test]
    fn cluster_dns() {
        assert_eq!(
            cluster_dns_name("pv-migrate-abcde-sshd", "ns1"),
            "pv-migrate-abcde-sshd.ns1"
        );
    }
}
