// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network topology builder
//!
//! Allocates the isolated address space and the single subnet tier the
//! gateway is placed in. Nothing is created here; the topology is a value
//! handed downstream to the instance provisioner and synthesizer.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RdGateError, Result};

const COMPONENT: &str = "network";

/// Whether the subnet tier is routable from the internet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetVisibility {
    Public,
    Private,
}

impl std::fmt::Display for SubnetVisibility {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubnetVisibility::Public => write!(formatter, "Public"),
            SubnetVisibility::Private => write!(formatter, "Private"),
        }
    }
}

/// Input to [`build_topology`]
#[derive(Debug, Clone)]
pub struct TopologyRequest {
    /// Address block of the isolated network
    pub block: Ipv4Net,
    /// Prefix length of each subnet in the tier
    pub subnet_mask: u8,
    pub visibility: SubnetVisibility,
    /// One subnet is allocated per zone
    pub availability_zones: u8,
    pub nat_gateways: u32,
}

/// An isolated address space with one subnet tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkTopology {
    block: Ipv4Net,
    subnet_mask: u8,
    visibility: SubnetVisibility,
    subnets: Vec<Ipv4Net>,
    nat_gateways: u32,
}

impl NetworkTopology {
    pub fn block(&self) -> Ipv4Net {
        self.block
    }

    pub fn subnet_mask(&self) -> u8 {
        self.subnet_mask
    }

    pub fn visibility(&self) -> SubnetVisibility {
        self.visibility
    }

    /// Allocated subnets, in address order
    pub fn subnets(&self) -> &[Ipv4Net] {
        &self.subnets
    }

    /// Subnet the gateway instance is placed in
    pub fn primary_subnet(&self) -> Ipv4Net {
        // build_topology never returns an empty tier
        self.subnets[0]
    }

    pub fn nat_gateways(&self) -> u32 {
        self.nat_gateways
    }

    /// Public tiers route through an internet gateway
    pub fn has_internet_gateway(&self) -> bool {
        self.visibility == SubnetVisibility::Public
    }
}

/// Allocate a topology for the requested block and subnet mask
///
/// Fails with a configuration error when the subnet range does not fit in
/// the block, when the block carries host bits, or when NAT gateways are
/// requested for a single-tier network.
pub fn build_topology(request: &TopologyRequest) -> Result<NetworkTopology> {
    let block = request.block;

    if block.trunc() != block {
        return Err(RdGateError::configuration(
            COMPONENT,
            format!("address block {} has host bits set (expected {})", block, block.trunc()),
        ));
    }

    if request.subnet_mask < block.prefix_len() || request.subnet_mask > 32 {
        return Err(RdGateError::configuration(
            COMPONENT,
            format!(
                "subnet mask /{} does not fit within block {}",
                request.subnet_mask, block
            ),
        ));
    }

    if request.availability_zones == 0 {
        return Err(RdGateError::configuration(
            COMPONENT,
            "at least one availability zone is required",
        ));
    }

    if request.nat_gateways > 0 {
        return Err(RdGateError::configuration(
            COMPONENT,
            format!(
                "{} NAT gateway(s) requested but a single {} tier has no private subnets to serve",
                request.nat_gateways, request.visibility
            ),
        ));
    }

    let subnets: Vec<Ipv4Net> = block
        .subnets(request.subnet_mask)
        .map_err(|e| RdGateError::configuration(COMPONENT, e.to_string()))?
        .take(request.availability_zones as usize)
        .collect();

    if subnets.len() < request.availability_zones as usize {
        return Err(RdGateError::configuration(
            COMPONENT,
            format!(
                "block {} holds only {} /{} subnet(s), {} zones requested",
                block,
                subnets.len(),
                request.subnet_mask,
                request.availability_zones
            ),
        ));
    }

    debug!(
        block = %block,
        mask = request.subnet_mask,
        subnets = subnets.len(),
        "Allocated network topology"
    );

    Ok(NetworkTopology {
        block,
        subnet_mask: request.subnet_mask,
        visibility: request.visibility,
        subnets,
        nat_gateways: request.nat_gateways,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(block: &str, mask: u8) -> TopologyRequest {
        TopologyRequest {
            block: block.parse().unwrap(),
            subnet_mask: mask,
            visibility: SubnetVisibility::Public,
            availability_zones: 1,
            nat_gateways: 0,
        }
    }

    #[test]
    fn test_default_bastion_topology() {
        let topology = build_topology(&request("172.16.0.0/16", 20)).unwrap();
        assert_eq!(topology.subnets().len(), 1);
        assert_eq!(topology.primary_subnet(), "172.16.0.0/20".parse::<Ipv4Net>().unwrap());
        assert_eq!(topology.nat_gateways(), 0);
        assert!(topology.has_internet_gateway());
    }

    #[test]
    fn test_mask_must_fit_in_block() {
        // Every mask at or below the block prefix is accepted, anything wider fails
        for mask in 0..=32u8 {
            let result = build_topology(&request("172.16.0.0/16", mask));
            if mask >= 16 {
                let topology = result.unwrap();
                assert!(topology.block().contains(&topology.primary_subnet()));
            } else {
                assert!(matches!(
                    result,
                    Err(RdGateError::ConfigurationError { component: "network", .. })
                ));
            }
        }
    }

    #[test]
    fn test_mask_above_32_rejected() {
        assert!(build_topology(&request("10.0.0.0/8", 33)).is_err());
    }

    #[test]
    fn test_multiple_zones_are_disjoint() {
        let mut req = request("172.16.0.0/16", 20);
        req.availability_zones = 3;
        let topology = build_topology(&req).unwrap();
        let subnets = topology.subnets();
        assert_eq!(subnets.len(), 3);
        assert_eq!(subnets[1], "172.16.16.0/20".parse::<Ipv4Net>().unwrap());
        assert_eq!(subnets[2], "172.16.32.0/20".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn test_too_many_zones_for_block() {
        let mut req = request("10.0.0.0/24", 24);
        req.availability_zones = 2;
        assert!(build_topology(&req).is_err());
    }

    #[test]
    fn test_host_bits_rejected() {
        assert!(build_topology(&request("172.16.1.0/16", 20)).is_err());
    }

    #[test]
    fn test_nat_gateways_rejected_for_single_tier() {
        let mut req = request("172.16.0.0/16", 20);
        req.nat_gateways = 1;
        assert!(build_topology(&req).is_err());
    }
}
