//! Authoritative read-back of an instance.

use std::collections::BTreeSet;
use std::net::IpAddr;

use tracing::info;

use super::InstanceOrchestrator;
use crate::compute::{
    Cloud, InterfaceRecord, Microversion, ServerRecord, VolumeAttachmentRecord,
};
use crate::error::{LifecycleError, Step};
use crate::instance::{Instance, InstanceConfig, NetworkAttachment, NetworkConfig, PowerState};

/// Result of reading an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    /// The instance exists.
    Present(Box<Instance>),
    /// The instance no longer exists; the local record should be dropped.
    Gone,
}

impl<C> InstanceOrchestrator<C>
where
    C: Cloud,
{
    /// Reads the instance and its sub-resources.
    ///
    /// `config` is only consulted to decide which attachment supplies the
    /// access address.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Api`] when a call fails for any reason other
    /// than the instance having vanished.
    pub async fn read(
        &self,
        server_id: &str,
        config: &InstanceConfig,
    ) -> Result<ReadOutcome, LifecycleError> {
        let server = match self.cloud.get_server(server_id).await {
            Ok(server) => server,
            Err(err) if err.is_not_found() => {
                info!(instance_id = server_id, "instance no longer exists");
                return Ok(ReadOutcome::Gone);
            }
            Err(err) => return Err(LifecycleError::api(server_id, Step::Read, err)),
        };
        let read_err = |err| LifecycleError::api(server_id, Step::Read, err);
        let interfaces = self
            .cloud
            .list_interfaces(server_id)
            .await
            .map_err(read_err)?;
        let tags = self
            .cloud
            .list_tags(server_id, Microversion::TAGS)
            .await
            .map_err(read_err)?;
        let volumes = self
            .cloud
            .list_volume_attachments(server_id)
            .await
            .map_err(read_err)?;
        Ok(ReadOutcome::Present(Box::new(assemble(
            server,
            &interfaces,
            tags,
            &volumes,
            config,
        ))))
    }

    pub(super) async fn read_present(
        &self,
        server_id: &str,
        config: &InstanceConfig,
    ) -> Result<Instance, LifecycleError> {
        match self.read(server_id, config).await? {
            ReadOutcome::Present(instance) => Ok(*instance),
            ReadOutcome::Gone => Err(LifecycleError::Gone {
                instance_id: server_id.to_owned(),
                step: Step::Read,
            }),
        }
    }
}

fn assemble(
    server: ServerRecord,
    interfaces: &[InterfaceRecord],
    tags: BTreeSet<String>,
    volumes: &[VolumeAttachmentRecord],
    config: &InstanceConfig,
) -> Instance {
    let networks: Vec<NetworkAttachment> = interfaces
        .iter()
        .map(|interface| attachment(&server, interface, &config.networks))
        .collect();

    let access = networks.iter().find(|network| network.access_network);
    let access_ip_v4 = access
        .and_then(|network| network.fixed_ip_v4)
        .or_else(|| server.access_ip_v4.as_deref().and_then(|ip| ip.parse().ok()))
        .or_else(|| networks.iter().find_map(|network| network.fixed_ip_v4));
    let access_ip_v6 = access
        .and_then(|network| network.fixed_ip_v6)
        .or_else(|| server.access_ip_v6.as_deref().and_then(|ip| ip.parse().ok()))
        .or_else(|| networks.iter().find_map(|network| network.fixed_ip_v6));

    Instance {
        power_state: PowerState::from_status(&server.status),
        id: server.id,
        name: server.name,
        status: server.status,
        image_id: server.image_id,
        flavor_id: server.flavor_id,
        availability_zone: server.availability_zone,
        networks,
        access_ip_v4,
        access_ip_v6,
        metadata: server.metadata,
        tags,
        security_groups: server.security_groups.into_iter().collect(),
        volume_attachments: volumes
            .iter()
            .map(|volume| volume.volume_id.clone())
            .collect(),
    }
}

fn attachment(
    server: &ServerRecord,
    interface: &InterfaceRecord,
    configured: &[NetworkConfig],
) -> NetworkAttachment {
    let name = server
        .addresses
        .iter()
        .find(|address| interface.fixed_ips.contains(&address.addr))
        .map(|address| address.network_name.clone());
    let fixed_ip_v4 = interface.fixed_ips.iter().find_map(|ip| match ip {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    });
    let fixed_ip_v6 = interface.fixed_ips.iter().find_map(|ip| match ip {
        IpAddr::V6(v6) => Some(*v6),
        IpAddr::V4(_) => None,
    });
    let access_network = configured.iter().any(|network| {
        network.access_network
            && (network.port.as_deref() == Some(interface.port_id.as_str())
                || network.uuid.as_deref() == Some(interface.network_id.as_str())
                || (network.name.is_some() && network.name == name))
    });
    NetworkAttachment {
        network_id: interface.network_id.clone(),
        name,
        port_id: interface.port_id.clone(),
        fixed_ip_v4,
        fixed_ip_v6,
        mac: interface.mac.clone(),
        access_network,
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::compute::AddressRecord;

    fn interface(port: &str, network: &str, ip: [u8; 4]) -> InterfaceRecord {
        InterfaceRecord {
            port_id: port.to_owned(),
            network_id: network.to_owned(),
            mac: Some(format!("fa:16:3e:00:00:{:02x}", ip[3])),
            port_state: String::from("ACTIVE"),
            fixed_ips: vec![IpAddr::V4(Ipv4Addr::from(ip))],
        }
    }

    fn server() -> ServerRecord {
        ServerRecord {
            id: String::from("srv-1"),
            name: String::from("web-1"),
            status: String::from("ACTIVE"),
            addresses: vec![AddressRecord {
                network_name: String::from("private"),
                addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
                mac: None,
            }],
            ..ServerRecord::default()
        }
    }

    #[test]
    fn access_network_wins_over_first_address() {
        let interfaces = [
            interface("port-a", "net-a", [10, 0, 0, 5]),
            interface("port-b", "net-b", [192, 168, 1, 9]),
        ];
        let config = InstanceConfig {
            networks: vec![
                NetworkConfig {
                    uuid: Some(String::from("net-a")),
                    ..NetworkConfig::default()
                },
                NetworkConfig {
                    port: Some(String::from("port-b")),
                    access_network: true,
                    ..NetworkConfig::default()
                },
            ],
            ..InstanceConfig::named("web-1")
        };

        let instance = assemble(server(), &interfaces, BTreeSet::new(), &[], &config);

        assert_eq!(instance.access_ip_v4, Some(Ipv4Addr::new(192, 168, 1, 9)));
        assert_eq!(instance.networks.first().and_then(|n| n.name.as_deref()), Some("private"));
    }

    #[test]
    fn server_access_address_beats_first_fixed_address() {
        let interfaces = [interface("port-a", "net-a", [10, 0, 0, 5])];
        let record = ServerRecord {
            access_ip_v4: Some(String::from("203.0.113.7")),
            ..server()
        };

        let instance = assemble(
            record,
            &interfaces,
            BTreeSet::new(),
            &[],
            &InstanceConfig::named("web-1"),
        );

        assert_eq!(instance.access_ip_v4, Some(Ipv4Addr::new(203, 0, 113, 7)));
    }

    #[test]
    fn falls_back_to_first_fixed_address() {
        let interfaces = [
            interface("port-a", "net-a", [10, 0, 0, 5]),
            interface("port-b", "net-b", [10, 0, 1, 5]),
        ];
        let volumes = [VolumeAttachmentRecord {
            volume_id: String::from("vol-1"),
            device: Some(String::from("/dev/vdb")),
        }];

        let instance = assemble(
            server(),
            &interfaces,
            BTreeSet::new(),
            &volumes,
            &InstanceConfig::named("web-1"),
        );

        assert_eq!(instance.access_ip_v4, Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(instance.access_ip_v6, None);
        assert_eq!(instance.volume_attachments, vec![String::from("vol-1")]);
        assert_eq!(instance.power_state, PowerState::Active);
    }
}
