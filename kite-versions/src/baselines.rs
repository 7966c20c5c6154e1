//! Built-in version tables for successive Kafka releases.
//!
//! Each constructor builds on the previous release, mirroring how the
//! protocol actually evolved: keys are only ever added and maximum versions
//! only ever raised. The numbers come from the Kafka protocol history; when
//! a release neither added keys nor raised versions relevant to clients it
//! has no constructor here.
//!
//! Key numbering follows the protocol: 0 Produce, 1 Fetch, 2 ListOffsets,
//! 3 Metadata, 4 LeaderAndIsr, 5 StopReplica, 6 UpdateMetadata,
//! 7 ControlledShutdown, 8 OffsetCommit, 9 OffsetFetch, 10 FindCoordinator,
//! 11 JoinGroup, 12 Heartbeat, 13 LeaveGroup, 14 SyncGroup,
//! 15 DescribeGroups, 16 ListGroups, 17 SaslHandshake, 18 ApiVersions,
//! 19 CreateTopics, 20 DeleteTopics, and onward.

use std::sync::OnceLock;

use crate::VersionTable;

/// Kafka v0.8.0: the eight original request keys, all at version 0.
#[must_use]
pub fn v0_8_0() -> VersionTable {
    let mut v = VersionTable::empty();
    for key in 0..=7 {
        v.set_max(key, 0);
    }
    v
}

/// Kafka v0.8.1 added OffsetCommit and OffsetFetch.
#[must_use]
pub fn v0_8_1() -> VersionTable {
    let mut v = v0_8_0();
    v.set_max(8, 0); // OffsetCommit
    v.set_max(9, 0); // OffsetFetch
    v
}

/// Kafka v0.8.2 added FindCoordinator, JoinGroup, and Heartbeat.
#[must_use]
pub fn v0_8_2() -> VersionTable {
    let mut v = v0_8_1();
    v.set_max(8, 1); // Kafka-backed offset storage
    v.set_max(10, 0); // FindCoordinator
    v.set_max(11, 0); // JoinGroup
    v.set_max(12, 0); // Heartbeat
    v
}

/// Kafka v0.9.0 completed the group protocol.
#[must_use]
pub fn v0_9_0() -> VersionTable {
    let mut v = v0_8_2();
    v.set_max(0, 1);
    v.set_max(1, 1);
    v.set_max(8, 2);
    v.set_max(9, 1);
    v.set_max(13, 0); // LeaveGroup
    v.set_max(14, 0); // SyncGroup
    v.set_max(15, 0); // DescribeGroups
    v.set_max(16, 0); // ListGroups
    v
}

/// Kafka v0.10.0 added SaslHandshake and ApiVersions.
#[must_use]
pub fn v0_10_0() -> VersionTable {
    let mut v = v0_9_0();
    v.set_max(0, 2);
    v.set_max(1, 2);
    v.set_max(3, 1);
    v.set_max(6, 2);
    v.set_max(17, 0); // SaslHandshake
    v.set_max(18, 0); // ApiVersions
    v
}

/// Kafka v0.10.1 added CreateTopics and DeleteTopics.
#[must_use]
pub fn v0_10_1() -> VersionTable {
    let mut v = v0_10_0();
    v.set_max(1, 3);
    v.set_max(2, 1);
    v.set_max(3, 2);
    v.set_max(11, 1);
    v.set_max(19, 0); // CreateTopics
    v.set_max(20, 0); // DeleteTopics
    v
}

/// Kafka v0.10.2.
#[must_use]
pub fn v0_10_2() -> VersionTable {
    let mut v = v0_10_1();
    v.set_max(3, 3);
    v.set_max(9, 2);
    v.set_max(19, 1);
    v
}

/// Kafka v0.11.0: exactly-once semantics brought the transaction and ACL
/// keys (21 through 33) in one release.
#[must_use]
pub fn v0_11_0() -> VersionTable {
    let mut v = v0_10_2();
    v.set_max(0, 3);
    v.set_max(1, 5);
    v.set_max(2, 2);
    v.set_max(3, 4);
    v.set_max(8, 3);
    v.set_max(9, 3);
    v.set_max(10, 1);
    v.set_max(11, 2);
    v.set_max(12, 1);
    v.set_max(13, 1);
    v.set_max(14, 1);
    v.set_max(15, 1);
    v.set_max(16, 1);
    v.set_max(18, 1);
    v.set_max(19, 2);
    v.set_max(20, 1);
    v.set_max(21, 0); // DeleteRecords
    v.set_max(22, 0); // InitProducerId
    v.set_max(23, 0); // OffsetForLeaderEpoch
    v.set_max(24, 0); // AddPartitionsToTxn
    v.set_max(25, 0); // AddOffsetsToTxn
    v.set_max(26, 0); // EndTxn
    v.set_max(27, 0); // WriteTxnMarkers
    v.set_max(28, 0); // TxnOffsetCommit
    v.set_max(29, 0); // DescribeAcls
    v.set_max(30, 0); // CreateAcls
    v.set_max(31, 0); // DeleteAcls
    v.set_max(32, 0); // DescribeConfigs
    v.set_max(33, 0); // AlterConfigs
    v
}

/// Kafka v1.0.0 added log-dir management, SaslAuthenticate, and
/// CreatePartitions.
#[must_use]
pub fn v1_0_0() -> VersionTable {
    let mut v = v0_11_0();
    v.set_max(0, 5);
    v.set_max(1, 6);
    v.set_max(3, 5);
    v.set_max(4, 1);
    v.set_max(6, 4);
    v.set_max(23, 1);
    v.set_max(32, 1);
    v.set_max(34, 0); // AlterReplicaLogDirs
    v.set_max(35, 0); // DescribeLogDirs
    v.set_max(36, 0); // SaslAuthenticate
    v.set_max(37, 0); // CreatePartitions
    v
}

/// Kafka v1.1.0 added the delegation-token keys and DeleteGroups.
#[must_use]
pub fn v1_1_0() -> VersionTable {
    let mut v = v1_0_0();
    v.set_max(1, 7);
    v.set_max(21, 1);
    v.set_max(38, 0); // CreateDelegationToken
    v.set_max(39, 0); // RenewDelegationToken
    v.set_max(40, 0); // ExpireDelegationToken
    v.set_max(41, 0); // DescribeDelegationToken
    v.set_max(42, 0); // DeleteGroups
    v
}

/// Kafka v2.0.0: broad version bumps, no new keys.
#[must_use]
pub fn v2_0_0() -> VersionTable {
    let mut v = v1_1_0();
    v.set_max(0, 6);
    v.set_max(1, 8);
    v.set_max(2, 3);
    v.set_max(3, 6);
    v.set_max(8, 4);
    v.set_max(9, 4);
    v.set_max(10, 2);
    v.set_max(11, 3);
    v.set_max(12, 2);
    v.set_max(13, 2);
    v.set_max(14, 2);
    v.set_max(15, 2);
    v.set_max(16, 2);
    v.set_max(17, 1);
    v.set_max(18, 2);
    v.set_max(19, 3);
    v.set_max(20, 2);
    v.set_max(23, 2);
    v.set_max(29, 1);
    v.set_max(30, 1);
    v.set_max(31, 1);
    v.set_max(32, 2);
    v.set_max(33, 1);
    v.set_max(37, 1);
    v
}

/// Kafka v2.1.0.
#[must_use]
pub fn v2_1_0() -> VersionTable {
    let mut v = v2_0_0();
    v.set_max(0, 7);
    v.set_max(1, 10);
    v.set_max(2, 4);
    v.set_max(3, 7);
    v.set_max(8, 6);
    v.set_max(9, 5);
    v.set_max(23, 3);
    v
}

/// Kafka v2.2.0 added ElectLeaders.
#[must_use]
pub fn v2_2_0() -> VersionTable {
    let mut v = v2_1_0();
    v.set_max(2, 5);
    v.set_max(11, 4);
    v.set_max(36, 1);
    v.set_max(43, 0); // ElectLeaders
    v
}

/// Kafka v2.3.0 added IncrementalAlterConfigs.
#[must_use]
pub fn v2_3_0() -> VersionTable {
    let mut v = v2_2_0();
    v.set_max(1, 11);
    v.set_max(3, 8);
    v.set_max(8, 7);
    v.set_max(11, 5);
    v.set_max(12, 3);
    v.set_max(14, 3);
    v.set_max(44, 0); // IncrementalAlterConfigs
    v
}

/// Kafka v2.4.0: first flexible versions, partition reassignment keys, and
/// OffsetDelete.
#[must_use]
pub fn v2_4_0() -> VersionTable {
    let mut v = v2_3_0();
    v.set_max(0, 8);
    v.set_max(3, 9);
    v.set_max(8, 8);
    v.set_max(9, 6);
    v.set_max(10, 3);
    v.set_max(11, 6);
    v.set_max(12, 4);
    v.set_max(13, 3);
    v.set_max(14, 4);
    v.set_max(18, 3);
    v.set_max(19, 5);
    v.set_max(45, 0); // AlterPartitionReassignments
    v.set_max(46, 0); // ListPartitionReassignments
    v.set_max(47, 0); // OffsetDelete
    v
}

/// Kafka v2.5.0.
#[must_use]
pub fn v2_5_0() -> VersionTable {
    let mut v = v2_4_0();
    v.set_max(9, 7);
    v.set_max(11, 7);
    v.set_max(13, 4);
    v.set_max(14, 5);
    v.set_max(22, 3);
    v.set_max(36, 2);
    v
}

/// Kafka v2.6.0 added the client-quota keys.
#[must_use]
pub fn v2_6_0() -> VersionTable {
    let mut v = v2_5_0();
    v.set_max(3, 10);
    v.set_max(16, 4);
    v.set_max(19, 6);
    v.set_max(48, 0); // DescribeClientQuotas
    v.set_max(49, 0); // AlterClientQuotas
    v
}

/// Kafka v2.7.0 added the SCRAM-credential keys.
#[must_use]
pub fn v2_7_0() -> VersionTable {
    let mut v = v2_6_0();
    v.set_max(1, 12);
    v.set_max(2, 6);
    v.set_max(19, 7);
    v.set_max(50, 0); // DescribeUserScramCredentials
    v.set_max(51, 0); // AlterUserScramCredentials
    v
}

/// Kafka v2.8.0.
#[must_use]
pub fn v2_8_0() -> VersionTable {
    let mut v = v2_7_0();
    v.set_max(0, 9);
    v.set_max(2, 7);
    v.set_max(3, 11);
    v.set_max(10, 4);
    v
}

/// The newest release baseline built into this crate.
///
/// Useful as the "assume a modern broker" default before `ApiVersions`
/// negotiation has run.
#[must_use]
pub fn stable() -> VersionTable {
    v2_8_0()
}

/// Every baseline in ascending release order, paired with its label.
pub(crate) fn all() -> &'static [(&'static str, VersionTable)] {
    static ALL: OnceLock<Vec<(&'static str, VersionTable)>> = OnceLock::new();
    ALL.get_or_init(|| {
        vec![
            ("v0.8.0", v0_8_0()),
            ("v0.8.1", v0_8_1()),
            ("v0.8.2", v0_8_2()),
            ("v0.9.0", v0_9_0()),
            ("v0.10.0", v0_10_0()),
            ("v0.10.1", v0_10_1()),
            ("v0.10.2", v0_10_2()),
            ("v0.11.0", v0_11_0()),
            ("v1.0.0", v1_0_0()),
            ("v1.1.0", v1_1_0()),
            ("v2.0.0", v2_0_0()),
            ("v2.1.0", v2_1_0()),
            ("v2.2.0", v2_2_0()),
            ("v2.3.0", v2_3_0()),
            ("v2.4.0", v2_4_0()),
            ("v2.5.0", v2_5_0()),
            ("v2.6.0", v2_6_0()),
            ("v2.7.0", v2_7_0()),
            ("v2.8.0", v2_8_0()),
        ]
    })
}
