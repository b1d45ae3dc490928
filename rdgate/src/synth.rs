// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment synthesizer
//!
//! Orders the provisioning components through an explicit dependency graph
//! and emits the declarative descriptor handed to the provisioning
//! collaborator. The only output is the gateway instance handle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::bootstrap::{compose_payload, BootstrapPayload};
use crate::config::Config;
use crate::error::{RdGateError, Result};
use crate::identity::{bind_identity, CapabilityCatalog, Identity};
use crate::instance::{Instance, InstanceBuilder, MachineImage};
use crate::network::{build_topology, NetworkTopology, TopologyRequest};
use crate::security::{build_policy, SecurityPolicy};

/// Name of the single exported output
pub const INSTANCE_OUTPUT: &str = "gatewayInstance";

const NETWORK_ID: &str = "vpc";

/// A node in the provisioning dependency graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Component {
    Network,
    Identity,
    SecurityPolicy,
    BootstrapPayload,
    Instance,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Network,
        Component::Identity,
        Component::SecurityPolicy,
        Component::BootstrapPayload,
        Component::Instance,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Component::Network => "network",
            Component::Identity => "identity",
            Component::SecurityPolicy => "security",
            Component::BootstrapPayload => "bootstrap-script",
            Component::Instance => "instance",
        }
    }

    /// Components that must exist before this one
    pub const fn dependencies(self) -> &'static [Component] {
        match self {
            Component::Network | Component::Identity | Component::BootstrapPayload => &[],
            Component::SecurityPolicy => &[Component::Network],
            Component::Instance => &[
                Component::Network,
                Component::Identity,
                Component::SecurityPolicy,
                Component::BootstrapPayload,
            ],
        }
    }
}

/// Kahn's algorithm over the component graph; ties resolve in declaration order
pub fn topological_order() -> Result<Vec<Component>> {
    let mut remaining: BTreeMap<Component, BTreeSet<Component>> = Component::ALL
        .iter()
        .map(|c| (*c, c.dependencies().iter().copied().collect()))
        .collect();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(component, _)| *component)
            .ok_or_else(|| RdGateError::SynthesisError {
                component: "graph",
                message: "dependency cycle among components".to_string(),
            })?;

        remaining.remove(&ready);
        for deps in remaining.values_mut() {
            deps.remove(&ready);
        }
        order.push(ready);
    }

    Ok(order)
}

/// Provider resource category of a descriptor entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourceKind {
    NetworkTopology,
    InternetGateway,
    GatewayAttachment,
    Subnet,
    RouteTable,
    RouteTableAssociation,
    Route,
    Identity,
    InstanceProfile,
    SecurityPolicy,
    Instance,
}

impl ResourceKind {
    pub const fn resource_type(self) -> &'static str {
        match self {
            ResourceKind::NetworkTopology => "AWS::EC2::VPC",
            ResourceKind::InternetGateway => "AWS::EC2::InternetGateway",
            ResourceKind::GatewayAttachment => "AWS::EC2::VPCGatewayAttachment",
            ResourceKind::Subnet => "AWS::EC2::Subnet",
            ResourceKind::RouteTable => "AWS::EC2::RouteTable",
            ResourceKind::RouteTableAssociation => "AWS::EC2::SubnetRouteTableAssociation",
            ResourceKind::Route => "AWS::EC2::Route",
            ResourceKind::Identity => "AWS::IAM::Role",
            ResourceKind::InstanceProfile => "AWS::IAM::InstanceProfile",
            ResourceKind::SecurityPolicy => "AWS::EC2::SecurityGroup",
            ResourceKind::Instance => "AWS::EC2::Instance",
        }
    }
}

/// One resource in the deployment descriptor
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDescriptor {
    pub logical_id: String,
    pub kind: ResourceKind,
    pub depends_on: Vec<String>,
    pub properties: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Exported value
#[derive(Debug, Clone, Serialize)]
pub struct OutputDescriptor {
    pub name: String,
    /// Logical id of the resource whose provider id is exported
    pub references: String,
}

/// Ordered, declarative description of the whole deployment
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentDescriptor {
    pub stack_name: String,
    pub resources: Vec<ResourceDescriptor>,
    pub outputs: Vec<OutputDescriptor>,
}

impl DeploymentDescriptor {
    pub fn resource(&self, logical_id: &str) -> Option<&ResourceDescriptor> {
        self.resources.iter().find(|r| r.logical_id == logical_id)
    }

    pub fn resources_of(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceDescriptor> {
        self.resources.iter().filter(move |r| r.kind == kind)
    }

    /// CloudFormation template document
    pub fn to_template(&self) -> Value {
        let resources: serde_json::Map<String, Value> = self
            .resources
            .iter()
            .map(|r| {
                let mut entry = json!({
                    "Type": r.kind.resource_type(),
                    "Properties": r.properties,
                });
                if !r.depends_on.is_empty() {
                    entry["DependsOn"] = json!(r.depends_on);
                }
                if let Some(metadata) = &r.metadata {
                    entry["Metadata"] = metadata.clone();
                }
                (r.logical_id.clone(), entry)
            })
            .collect();

        let outputs: serde_json::Map<String, Value> = self
            .outputs
            .iter()
            .map(|o| (o.name.clone(), json!({ "Value": { "Ref": o.references } })))
            .collect();

        json!({
            "AWSTemplateFormatVersion": "2010-09-09",
            "Description": format!("{} remote desktop gateway bastion", self.stack_name),
            "Resources": resources,
            "Outputs": outputs,
        })
    }
}

/// Holds one slot per component until synthesis
#[derive(Debug, Clone, Default)]
pub struct Synthesizer {
    stack_name: String,
    network: Option<Arc<NetworkTopology>>,
    identity: Option<Arc<Identity>>,
    security_policy: Option<Arc<SecurityPolicy>>,
    payload: Option<Arc<BootstrapPayload>>,
    instance: Option<Instance>,
}

impl Synthesizer {
    pub fn new(stack_name: &str) -> Self {
        Self {
            stack_name: stack_name.to_string(),
            ..Self::default()
        }
    }

    pub fn network(mut self, network: Arc<NetworkTopology>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn identity(mut self, identity: Arc<Identity>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn security_policy(mut self, policy: Arc<SecurityPolicy>) -> Self {
        self.security_policy = Some(policy);
        self
    }

    pub fn payload(mut self, payload: Arc<BootstrapPayload>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn instance(mut self, instance: Instance) -> Self {
        self.instance = Some(instance);
        self
    }

    fn is_constructed(&self, component: Component) -> bool {
        match component {
            Component::Network => self.network.is_some(),
            Component::Identity => self.identity.is_some(),
            Component::SecurityPolicy => self.security_policy.is_some(),
            Component::BootstrapPayload => self.payload.is_some(),
            Component::Instance => self.instance.is_some(),
        }
    }

    /// Check the graph is complete and emit the descriptor
    pub fn synthesize(&self) -> Result<DeploymentDescriptor> {
        let order = topological_order()?;

        for component in &order {
            if !self.is_constructed(*component) {
                return Err(RdGateError::SynthesisError {
                    component: component.name(),
                    message: "component was never constructed".to_string(),
                });
            }
        }

        let (Some(network), Some(identity), Some(policy), Some(payload), Some(instance)) = (
            &self.network,
            &self.identity,
            &self.security_policy,
            &self.payload,
            &self.instance,
        ) else {
            return Err(RdGateError::SynthesisError {
                component: "graph",
                message: "component slots changed during synthesis".to_string(),
            });
        };

        let mismatched = [
            (Component::Network, Arc::ptr_eq(network, instance.network())),
            (Component::Identity, Arc::ptr_eq(identity, instance.identity())),
            (Component::SecurityPolicy, Arc::ptr_eq(policy, instance.security_policy())),
            (Component::BootstrapPayload, Arc::ptr_eq(payload, instance.payload())),
        ];
        if let Some((component, _)) = mismatched.iter().find(|(_, same)| !same) {
            return Err(RdGateError::SynthesisError {
                component: component.name(),
                message: "instance references a different value than the one synthesized".to_string(),
            });
        }

        let instance_id = instance.logical_id().to_string();
        let policy_id = format!("{}SecurityGroup", instance_id);

        let mut resources = Vec::new();
        for component in order {
            let produced = match component {
                Component::Network => network_resources(network),
                Component::Identity => identity_resources(identity),
                Component::SecurityPolicy => vec![ResourceDescriptor {
                    logical_id: policy_id.clone(),
                    kind: ResourceKind::SecurityPolicy,
                    depends_on: vec![NETWORK_ID.to_string()],
                    properties: policy_properties(policy),
                    metadata: None,
                }],
                // Carried inside the instance resource
                Component::BootstrapPayload => continue,
                Component::Instance => vec![instance_resource(
                    &self.stack_name,
                    instance,
                    identity,
                    network,
                    payload,
                    &policy_id,
                )],
            };
            for resource in &produced {
                debug!(resource = %resource.logical_id, kind = ?resource.kind, "Synthesized resource");
            }
            resources.extend(produced);
        }

        info!(
            stack = %self.stack_name,
            resources = resources.len(),
            "Synthesized deployment descriptor"
        );

        Ok(DeploymentDescriptor {
            stack_name: self.stack_name.clone(),
            resources,
            outputs: vec![OutputDescriptor {
                name: INSTANCE_OUTPUT.to_string(),
                references: instance_id,
            }],
        })
    }
}

fn subnet_id(network: &NetworkTopology, index: usize) -> String {
    format!("{}{}Subnet{}", NETWORK_ID, network.visibility(), index + 1)
}

fn resource(
    logical_id: String,
    kind: ResourceKind,
    depends_on: Vec<String>,
    properties: Value,
) -> ResourceDescriptor {
    ResourceDescriptor {
        logical_id,
        kind,
        depends_on,
        properties,
        metadata: None,
    }
}

/// The address space, one subnet per zone with its route table, and for a
/// public tier the internet gateway plus a default route through it
fn network_resources(network: &NetworkTopology) -> Vec<ResourceDescriptor> {
    let public = network.has_internet_gateway();
    let gateway_id = format!("{}IGW", NETWORK_ID);
    let attachment_id = format!("{}VPCGW", NETWORK_ID);

    let mut resources = vec![resource(
        NETWORK_ID.to_string(),
        ResourceKind::NetworkTopology,
        vec![],
        json!({
            "CidrBlock": network.block().to_string(),
            "EnableDnsHostnames": true,
            "EnableDnsSupport": true,
            "InstanceTenancy": "default",
        }),
    )];

    if public {
        resources.push(resource(
            gateway_id.clone(),
            ResourceKind::InternetGateway,
            vec![],
            json!({}),
        ));
        resources.push(resource(
            attachment_id.clone(),
            ResourceKind::GatewayAttachment,
            vec![NETWORK_ID.to_string(), gateway_id.clone()],
            json!({
                "VpcId": { "Ref": NETWORK_ID },
                "InternetGatewayId": { "Ref": &gateway_id },
            }),
        ));
    }

    for (index, cidr) in network.subnets().iter().enumerate() {
        let subnet = subnet_id(network, index);
        let route_table = format!("{}RouteTable", subnet);

        resources.push(resource(
            subnet.clone(),
            ResourceKind::Subnet,
            vec![NETWORK_ID.to_string()],
            json!({
                "VpcId": { "Ref": NETWORK_ID },
                "CidrBlock": cidr.to_string(),
                "AvailabilityZone": { "Fn::Select": [index, { "Fn::GetAZs": "" }] },
                "MapPublicIpOnLaunch": public,
            }),
        ));
        resources.push(resource(
            route_table.clone(),
            ResourceKind::RouteTable,
            vec![NETWORK_ID.to_string()],
            json!({ "VpcId": { "Ref": NETWORK_ID } }),
        ));
        resources.push(resource(
            format!("{}RouteTableAssociation", subnet),
            ResourceKind::RouteTableAssociation,
            vec![route_table.clone(), subnet.clone()],
            json!({
                "RouteTableId": { "Ref": &route_table },
                "SubnetId": { "Ref": &subnet },
            }),
        ));
        if public {
            resources.push(resource(
                format!("{}DefaultRoute", subnet),
                ResourceKind::Route,
                vec![route_table.clone(), attachment_id.clone()],
                json!({
                    "RouteTableId": { "Ref": &route_table },
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "GatewayId": { "Ref": &gateway_id },
                }),
            ));
        }
    }

    resources
}

/// The role and the instance profile that attaches it to the instance
fn identity_resources(identity: &Identity) -> Vec<ResourceDescriptor> {
    let role_id = identity.name().to_string();
    vec![
        resource(
            role_id.clone(),
            ResourceKind::Identity,
            vec![],
            json!({
                "AssumeRolePolicyDocument": identity.trust_policy(),
                "ManagedPolicyArns": identity
                    .capabilities()
                    .iter()
                    .map(|c| c.arn.clone())
                    .collect::<Vec<_>>(),
            }),
        ),
        resource(
            instance_profile_id(identity),
            ResourceKind::InstanceProfile,
            vec![role_id.clone()],
            json!({ "Roles": [{ "Ref": &role_id }] }),
        ),
    ]
}

fn instance_profile_id(identity: &Identity) -> String {
    format!("{}InstanceProfile", identity.name())
}

fn instance_resource(
    stack_name: &str,
    instance: &Instance,
    identity: &Identity,
    network: &NetworkTopology,
    payload: &BootstrapPayload,
    policy_id: &str,
) -> ResourceDescriptor {
    let profile_id = instance_profile_id(identity);
    let subnet = subnet_id(network, 0);

    let mut depends_on = vec![profile_id.clone(), policy_id.to_string(), subnet.clone()];
    if network.has_internet_gateway() {
        // cfn-init needs the default route before the instance boots
        depends_on.push(format!("{}DefaultRoute", subnet));
    }

    ResourceDescriptor {
        logical_id: instance.logical_id().to_string(),
        kind: ResourceKind::Instance,
        depends_on,
        properties: json!({
            "InstanceType": instance.machine_class(),
            "ImageId": format!("{{{{resolve:ssm:{}}}}}", instance.image().parameter_path()),
            "IamInstanceProfile": { "Ref": &profile_id },
            "SubnetId": { "Ref": &subnet },
            "SecurityGroupIds": [{ "Fn::GetAtt": [policy_id, "GroupId"] }],
            "UserData": { "Fn::Base64": { "Fn::Sub": instance.user_data() } },
            "Tags": [{ "Key": "Name", "Value": format!("{}/{}", stack_name, instance.logical_id()) }],
        }),
        metadata: Some(json!({
            "AWS::CloudFormation::Init": {
                "config": {
                    "files": {
                        (payload.target_path()): { "content": payload.body() }
                    }
                }
            }
        })),
    }
}

fn policy_properties(policy: &SecurityPolicy) -> Value {
    let ingress: Vec<Value> = policy.ingress().map(|r| r.to_provider()).collect();
    let mut egress: Vec<Value> = policy.egress().map(|r| r.to_provider()).collect();
    if egress.is_empty() {
        // An empty egress list means allow-all to the provider; this rule matches nothing
        egress.push(json!({
            "CidrIp": "255.255.255.255/32",
            "IpProtocol": "icmp",
            "FromPort": 252,
            "ToPort": 86,
            "Description": "Disallow all traffic",
        }));
    }
    json!({
        "GroupDescription": policy.description(),
        "VpcId": { "Ref": NETWORK_ID },
        "SecurityGroupIngress": ingress,
        "SecurityGroupEgress": egress,
    })
}

/// Build every component from `config` and synthesize the deployment
///
/// Fails on the first component that cannot be built; nothing is submitted
/// anywhere.
pub fn synthesize_from_config(config: &Config) -> Result<DeploymentDescriptor> {
    let network = Arc::new(build_topology(&TopologyRequest {
        block: config.network.cidr,
        subnet_mask: config.network.subnet_mask,
        visibility: config.network.visibility,
        availability_zones: config.network.availability_zones,
        nat_gateways: config.network.nat_gateways,
    })?);

    let identity = Arc::new(bind_identity(
        &CapabilityCatalog::default(),
        &config.identity.role_name,
        &config.identity.trusted_principal,
        &config.identity.capability,
    )?);

    let policy = Arc::new(build_policy(
        &config.instance.logical_id,
        &config.security.trusted_peers,
        config.security.allow_all_outbound,
    )?);

    let payload = Arc::new(compose_payload(&config.bootstrap.dns_name)?);

    let instance = InstanceBuilder::new(&config.instance.logical_id)
        .machine_class(&config.instance.machine_class)
        .image(MachineImage {
            family: config.instance.image_family,
            name: config.instance.image.clone(),
        })
        .network(Arc::clone(&network))
        .identity(Arc::clone(&identity))
        .security_policy(Arc::clone(&policy))
        .payload(Arc::clone(&payload))
        .build()?;

    Synthesizer::new(&config.name)
        .network(network)
        .identity(identity)
        .security_policy(policy)
        .payload(payload)
        .instance(instance)
        .synthesize()
}
