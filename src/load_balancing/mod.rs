pub mod balancer;

pub use balancer::{
    create_load_balancer, InstanceStats, LeastConnectionsBalancer, LoadBalancer, LoadBalancerStats,
    RoundRobinBalancer, WeightedRoundRobinBalancer,
};
pub use crate::core::config::LoadBalancingStrategy;
