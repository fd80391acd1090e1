use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use proptest::prelude::*;
use sluice_metrics::test::TestRecorder;

use super::*;
use crate::{
    collector::{Disposition, RecordingCollector},
    delivery::{self, DeliveryError, DeliveryHandle, DeliveryPromise},
    producer::{
        memory::{MemoryBroker, StoredMessage},
        BrokerProperties, ProducerError, ProducerSettings,
    },
    record::{FieldValue, RecordId},
};

const TOPIC: &str = "test-topic";
const TIMEOUT: Duration = Duration::from_secs(5);
const STRING_SERIALIZER: &str = "org.apache.kafka.common.serialization.StringSerializer";
const BYTE_ARRAY_SERIALIZER: &str = "org.apache.kafka.common.serialization.ByteArraySerializer";

fn broker_properties(broker: &MemoryBroker, serializer: &str) -> BrokerProperties {
    [
        ("request.required.acks", "1".to_string()),
        ("serializer.class", "kafka.serializer.StringEncoder".to_string()),
        ("bootstrap.servers", broker.connection_string()),
        ("key.serializer", serializer.to_string()),
        ("value.serializer", serializer.to_string()),
        ("metadata.fetch.timeout.ms", "1000".to_string()),
        ("linger.ms", "0".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn configuration(broker: &MemoryBroker, serializer: &str) -> ForwardingBoltConfiguration {
    broker_properties(broker, serializer).into_iter().fold(
        ForwardingBoltConfiguration::default().with_topic(TOPIC),
        |config, (k, v)| config.with_broker_property(k, v),
    )
}

fn string_configuration(broker: &MemoryBroker) -> ForwardingBoltConfiguration {
    configuration(broker, STRING_SERIALIZER).with_async(false)
}

fn byte_array_configuration(
    broker: &MemoryBroker, async_send: bool, fire_and_forget: bool,
) -> ForwardingBoltConfiguration {
    configuration(broker, BYTE_ARRAY_SERIALIZER)
        .with_async(async_send)
        .with_fire_and_forget(fire_and_forget)
}

fn prepare(config: &ForwardingBoltConfiguration, broker: &MemoryBroker) -> (ForwardingBolt, Arc<RecordingCollector>) {
    let collector = Arc::new(RecordingCollector::new());
    let bolt = config.build(broker, collector.clone()).unwrap();
    (bolt, collector)
}

fn keyed_record(id: u64, key: impl Into<FieldValue>, message: impl Into<FieldValue>) -> Record {
    Record::new(id, [("key", key.into()), ("message", message.into())])
}

fn only_message(broker: &MemoryBroker, topic: &str) -> StoredMessage {
    let mut messages = broker.messages(topic);
    assert_eq!(messages.len(), 1, "expected exactly one message in '{}'", topic);
    messages.remove(0)
}

fn setup_error(config: &ForwardingBoltConfiguration) -> String {
    let broker = MemoryBroker::new();
    let collector = Arc::new(RecordingCollector::new());
    match config.build(&broker, collector) {
        Ok(_) => panic!("setup should have failed"),
        Err(e) => format!("{:#}", e),
    }
}

#[test]
fn execute_with_key() {
    let broker = MemoryBroker::new();
    let (mut bolt, collector) = prepare(&string_configuration(&broker), &broker);
    assert_eq!(bolt.mode(), DeliveryMode::Sync);

    bolt.execute(&keyed_record(1, "key-123", "value-123"));

    assert_eq!(collector.dispositions(), vec![Disposition::Acked(RecordId::new(1))]);
    assert_eq!(broker.latest_offset(TOPIC, 0), 1);
    let message = broker.fetch(TOPIC, 0, 0).unwrap();
    assert_eq!(message.key, Some(Bytes::from_static(b"key-123")));
    assert_eq!(message.value, Bytes::from_static(b"value-123"));

    bolt.cleanup();
}

#[test]
fn execute_without_key() {
    let broker = MemoryBroker::new();
    let (mut bolt, collector) = prepare(&string_configuration(&broker), &broker);

    bolt.execute(&Record::new(1, [("message", "value-234")]));

    assert_eq!(collector.acked(), vec![RecordId::new(1)]);
    let message = only_message(&broker, TOPIC);
    assert_eq!(message.key, None);
    assert_eq!(message.value, Bytes::from_static(b"value-234"));

    bolt.cleanup();
}

#[test]
fn execute_with_broker_down() {
    let broker = MemoryBroker::new();
    let (mut bolt, collector) = prepare(&string_configuration(&broker), &broker);

    broker.shutdown();
    bolt.execute(&keyed_record(1, "key-123", "value-123"));

    assert_eq!(collector.dispositions(), vec![Disposition::Failed(RecordId::new(1))]);
    assert_eq!(collector.errors().len(), 1);
    assert!(collector.errors()[0].starts_with("Failed to submit record to broker."));
    assert_eq!(broker.latest_offset(TOPIC, 0), 0);

    bolt.cleanup();
}

#[test]
fn should_acknowledge_tick_records() {
    let broker = MemoryBroker::new();
    let (mut bolt, collector) = prepare(&string_configuration(&broker), &broker);

    // Ticks never reach the broker, so they are acked even while it is down.
    broker.shutdown();
    bolt.execute(&Record::tick(1));

    assert_eq!(collector.dispositions(), vec![Disposition::Acked(RecordId::new(1))]);
    assert!(collector.errors().is_empty());
    assert!(broker.messages(TOPIC).is_empty());

    bolt.cleanup();
}

#[test]
fn execute_with_byte_array_key_and_message_in_every_mode() {
    for (async_send, fire_and_forget, mode) in [
        (false, false, DeliveryMode::Sync),
        (true, false, DeliveryMode::Async),
        (true, true, DeliveryMode::FireAndForget),
    ] {
        let broker = MemoryBroker::new();
        let config = byte_array_configuration(&broker, async_send, fire_and_forget);
        let (mut bolt, collector) = prepare(&config, &broker);
        assert_eq!(bolt.mode(), mode);

        bolt.execute(&keyed_record(1, b"test-key".to_vec(), b"test-message".to_vec()));
        assert!(collector.wait_for(1, TIMEOUT), "no disposition in {:?} mode", mode);
        bolt.cleanup();

        assert_eq!(collector.dispositions(), vec![Disposition::Acked(RecordId::new(1))]);
        let message = only_message(&broker, TOPIC);
        assert_eq!(message.key, Some(Bytes::from_static(b"test-key")));
        assert_eq!(message.value, Bytes::from_static(b"test-message"));
    }
}

#[test]
fn producer_properties_take_precedence_over_configuration() {
    let broker = MemoryBroker::new();
    let config = ForwardingBoltConfiguration::default()
        .with_topic(TOPIC)
        .with_async(false)
        .with_broker_property("bootstrap.servers", "unreachable:9092")
        .with_producer_properties(broker_properties(&broker, BYTE_ARRAY_SERIALIZER));
    let (mut bolt, collector) = prepare(&config, &broker);

    bolt.execute(&keyed_record(1, b"test-key".to_vec(), b"test-message".to_vec()));

    assert_eq!(collector.acked(), vec![RecordId::new(1)]);
    assert_eq!(only_message(&broker, TOPIC).value, Bytes::from_static(b"test-message"));

    bolt.cleanup();
}

#[test]
fn unmappable_records_are_failed_without_publishing() {
    let broker = MemoryBroker::new();
    let config = configuration(&broker, BYTE_ARRAY_SERIALIZER).with_async(false);
    let (mut bolt, collector) = prepare(&config, &broker);

    // No message field.
    bolt.execute(&Record::new(1, [("key", b"k".to_vec())]));
    // Null message.
    bolt.execute(&Record::new(2, [("key", FieldValue::from(b"k".to_vec())), ("message", FieldValue::Null)]));
    // String value for a byte array serializer.
    bolt.execute(&keyed_record(3, b"k".to_vec(), "text"));

    assert_eq!(collector.failed(), vec![RecordId::new(1), RecordId::new(2), RecordId::new(3)]);
    assert!(collector.acked().is_empty());

    let errors = collector.errors();
    assert_eq!(errors.len(), 3);
    assert!(errors[0].contains("record has no 'message' field"));
    assert!(errors[1].contains("record field 'message' is null"));
    assert!(errors[2].contains("byte array serializer cannot encode string value in field 'message'"));
    assert!(broker.messages(TOPIC).is_empty());

    bolt.cleanup();
}

#[test]
fn async_delivery_failure_fails_record() {
    let broker = MemoryBroker::new();
    let config = byte_array_configuration(&broker, true, false).with_broker_property("linger.ms", "200");
    let (mut bolt, collector) = prepare(&config, &broker);

    bolt.execute(&keyed_record(1, b"k".to_vec(), b"v".to_vec()));
    assert!(collector.dispositions().is_empty());
    broker.shutdown();

    assert!(collector.wait_for(1, TIMEOUT));
    assert_eq!(collector.dispositions(), vec![Disposition::Failed(RecordId::new(1))]);
    assert!(collector.errors()[0].starts_with("Failed to deliver record to broker."));

    bolt.cleanup();
}

#[test]
fn fire_and_forget_acks_despite_delivery_failure() {
    let broker = MemoryBroker::new();
    let config = byte_array_configuration(&broker, true, true).with_broker_property("linger.ms", "200");
    let (mut bolt, collector) = prepare(&config, &broker);

    bolt.execute(&keyed_record(1, b"k".to_vec(), b"v".to_vec()));
    assert_eq!(collector.dispositions(), vec![Disposition::Acked(RecordId::new(1))]);

    broker.shutdown();
    bolt.cleanup();

    assert_eq!(collector.dispositions(), vec![Disposition::Acked(RecordId::new(1))]);
    assert!(collector.errors().is_empty());
    assert!(broker.messages(TOPIC).is_empty());
}

#[test]
fn async_fails_records_that_cannot_be_submitted() {
    let broker = MemoryBroker::new();
    let (mut bolt, collector) = prepare(&byte_array_configuration(&broker, true, false), &broker);
    assert_eq!(bolt.mode(), DeliveryMode::Async);

    broker.shutdown();
    bolt.execute(&keyed_record(1, b"k".to_vec(), b"v".to_vec()));

    assert_eq!(collector.dispositions(), vec![Disposition::Failed(RecordId::new(1))]);
    assert!(collector.errors()[0].starts_with("Failed to submit record to broker."));

    bolt.cleanup();
    assert!(!collector.wait_for(2, Duration::from_millis(50)));
    assert_eq!(collector.dispositions(), vec![Disposition::Failed(RecordId::new(1))]);
}

#[test]
fn fire_and_forget_fails_records_that_cannot_be_submitted() {
    let broker = MemoryBroker::new();
    let (mut bolt, collector) = prepare(&byte_array_configuration(&broker, true, true), &broker);

    broker.shutdown();
    bolt.execute(&keyed_record(1, b"k".to_vec(), b"v".to_vec()));

    assert_eq!(collector.dispositions(), vec![Disposition::Failed(RecordId::new(1))]);

    bolt.cleanup();
}

#[test]
fn records_route_to_their_own_topic() {
    let broker = MemoryBroker::new();
    let config = string_configuration(&broker).with_mapper(FieldMapper::topic_fields());
    let (mut bolt, collector) = prepare(&config, &broker);

    bolt.execute(&Record::new(1, [("topic", "orders"), ("key", "k1"), ("message", "m1")]));
    bolt.execute(&Record::new(2, [("key", "k2"), ("message", "m2")]));

    assert_eq!(collector.acked(), vec![RecordId::new(1), RecordId::new(2)]);
    assert_eq!(only_message(&broker, "orders").value, Bytes::from_static(b"m1"));
    assert_eq!(only_message(&broker, TOPIC).value, Bytes::from_static(b"m2"));

    bolt.cleanup();
}

#[test]
fn records_without_any_topic_are_failed() {
    let broker = MemoryBroker::new();
    let config = ForwardingBoltConfiguration::default()
        .with_async(false)
        .with_topic_field("route")
        .with_broker_property("bootstrap.servers", broker.connection_string());
    let (mut bolt, collector) = prepare(&config, &broker);

    bolt.execute(&Record::new(1, [("route", "alerts"), ("message", "m1")]));
    bolt.execute(&Record::new(2, [("message", "m2")]));

    assert_eq!(collector.acked(), vec![RecordId::new(1)]);
    assert_eq!(collector.failed(), vec![RecordId::new(2)]);
    assert!(collector.errors()[0].contains("no topic available for record"));
    assert_eq!(only_message(&broker, "alerts").value, Bytes::from_static(b"m1"));

    bolt.cleanup();
}

#[test]
fn setup_rejects_invalid_configuration() {
    let base = || ForwardingBoltConfiguration::default().with_topic(TOPIC);

    assert_eq!(
        setup_error(&base()),
        "Invalid broker properties.: missing required broker property 'bootstrap.servers'"
    );
    assert!(setup_error(
        &base()
            .with_broker_property("bootstrap.servers", "localhost:9092")
            .with_broker_property("request.required.acks", "2")
    )
    .contains("invalid value '2' for broker property 'request.required.acks'"));
    assert!(setup_error(
        &base()
            .with_broker_property("bootstrap.servers", "localhost:9092")
            .with_broker_property("key.serializer", "com.example.AvroSerializer")
    )
    .contains("unknown serializer 'com.example.AvroSerializer'"));
    assert!(setup_error(
        &ForwardingBoltConfiguration::default().with_broker_property("bootstrap.servers", "localhost:9092")
    )
    .starts_with("No topic configured."));
}

#[test]
fn cleanup_without_traffic_and_twice() {
    let broker = MemoryBroker::new();
    let recorder = TestRecorder::default();
    let config = string_configuration(&broker).with_component_id("closed");
    let (mut bolt, collector) = metrics::with_local_recorder(&recorder, || prepare(&config, &broker));

    bolt.cleanup();
    bolt.cleanup();

    bolt.execute(&keyed_record(1, "k", "v"));
    assert_eq!(collector.dispositions(), vec![Disposition::Failed(RecordId::new(1))]);
    assert!(collector.errors()[0].contains("already been closed"));
    assert_eq!(
        recorder.counter_with_tags("bolt_errors_total", &[("component_id", "closed"), ("error_type", "submit")]),
        Some(1)
    );
}

#[test]
fn cleanup_waits_for_in_flight_records_within_sub_second_timeout() {
    let broker = MemoryBroker::new();
    let config = byte_array_configuration(&broker, true, false)
        .with_broker_property("linger.ms", "100")
        .with_close_timeout(Duration::from_millis(900));
    let (mut bolt, collector) = prepare(&config, &broker);

    bolt.execute(&keyed_record(1, b"k".to_vec(), b"v".to_vec()));
    bolt.cleanup();

    assert_eq!(collector.dispositions(), vec![Disposition::Acked(RecordId::new(1))]);
    assert_eq!(only_message(&broker, TOPIC).value, Bytes::from_static(b"v"));
}

/// A producer whose deliveries are completed by the test.
#[derive(Default)]
struct ScriptedProducer {
    pending: Mutex<Vec<DeliveryPromise>>,
    closes: AtomicUsize,
}

impl ScriptedProducer {
    fn take_pending(&self) -> Vec<DeliveryPromise> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

impl Producer for ScriptedProducer {
    fn send(&self, _: PublishRequest) -> Result<DeliveryHandle, ProducerError> {
        let (promise, handle) = delivery::channel();
        self.pending.lock().unwrap().push(promise);
        Ok(handle)
    }

    fn flush(&self, _: Duration) -> Result<(), ProducerError> {
        Ok(())
    }

    fn close(&self, _: Duration) -> Result<(), ProducerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedFactory(Arc<ScriptedProducer>);

impl ProducerFactory for ScriptedFactory {
    fn connect(&self, _: &ProducerSettings) -> Result<Arc<dyn Producer>, GenericError> {
        Ok(self.0.clone())
    }
}

fn scripted_configuration() -> ForwardingBoltConfiguration {
    ForwardingBoltConfiguration::default()
        .with_topic(TOPIC)
        .with_broker_property("bootstrap.servers", "localhost:9092")
}

#[test]
fn async_completions_settle_in_completion_order() {
    let producer = Arc::new(ScriptedProducer::default());
    let collector = Arc::new(RecordingCollector::new());
    let mut bolt = scripted_configuration()
        .build(&ScriptedFactory(producer.clone()), collector.clone())
        .unwrap();

    bolt.execute(&keyed_record(1, "k1", "v1"));
    bolt.execute(&keyed_record(2, "k2", "v2"));
    bolt.execute(&keyed_record(3, "k3", "v3"));
    assert!(collector.dispositions().is_empty());

    let mut pending = producer.take_pending();
    let third = pending.pop().unwrap();
    let second = pending.pop().unwrap();
    let first = pending.pop().unwrap();

    third.complete(DeliveryOutcome::Success { partition: 0, offset: 0 });
    first.complete(DeliveryOutcome::Failure(DeliveryError::Rejected {
        reason: "message too large".to_string(),
    }));
    drop(second);

    assert_eq!(
        collector.dispositions(),
        vec![
            Disposition::Acked(RecordId::new(3)),
            Disposition::Failed(RecordId::new(1)),
            Disposition::Failed(RecordId::new(2)),
        ]
    );
    let errors = collector.errors();
    assert!(errors[0].contains("broker rejected message: message too large"));
    assert!(errors[1].contains("delivery abandoned by broker client"));

    bolt.cleanup();
    bolt.cleanup();
    assert_eq!(producer.closes.load(Ordering::SeqCst), 1);
}

struct PanickingCollector {
    calls: AtomicUsize,
}

impl OutputCollector for PanickingCollector {
    fn ack(&self, _: &Record) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("collector exploded");
    }

    fn fail(&self, _: &Record) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("collector exploded");
    }

    fn report_error(&self, _: &GenericError) {}
}

#[test]
fn collector_panics_in_completions_are_contained() {
    let producer = Arc::new(ScriptedProducer::default());
    let collector = Arc::new(PanickingCollector {
        calls: AtomicUsize::new(0),
    });
    let mut bolt = scripted_configuration()
        .build(&ScriptedFactory(producer.clone()), collector.clone())
        .unwrap();

    bolt.execute(&keyed_record(1, "k1", "v1"));
    bolt.execute(&keyed_record(2, "k2", "v2"));

    for promise in producer.take_pending() {
        promise.complete(DeliveryOutcome::Success { partition: 0, offset: 0 });
    }

    assert_eq!(collector.calls.load(Ordering::SeqCst), 2);
    bolt.cleanup();
}

#[test]
fn telemetry_counts_dispositions() {
    let broker = MemoryBroker::new();
    let recorder = TestRecorder::default();
    let config = string_configuration(&broker).with_component_id("forwarder");
    let (mut bolt, _collector) = metrics::with_local_recorder(&recorder, || prepare(&config, &broker));

    bolt.execute(&Record::tick(1));
    bolt.execute(&keyed_record(2, "k", "v"));
    bolt.execute(&Record::new(3, [("key", "k")]));
    broker.shutdown();
    bolt.execute(&keyed_record(4, "k", "v"));
    bolt.cleanup();

    let tags = [("component_id", "forwarder")];
    assert_eq!(recorder.counter_with_tags("bolt_ticks_acked_total", &tags), Some(1));
    assert_eq!(recorder.counter_with_tags("bolt_records_acked_total", &tags), Some(1));
    assert_eq!(recorder.counter_with_tags("bolt_records_failed_total", &tags), Some(2));
    assert_eq!(
        recorder.counter_with_tags("bolt_errors_total", &[("component_id", "forwarder"), ("error_type", "mapping")]),
        Some(1)
    );
    assert_eq!(
        recorder.counter_with_tags("bolt_errors_total", &[("component_id", "forwarder"), ("error_type", "submit")]),
        Some(1)
    );
    assert_eq!(
        recorder.counter_with_tags("bolt_errors_total", &[("component_id", "forwarder"), ("error_type", "delivery")]),
        Some(0)
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn property_every_record_is_settled_exactly_once(
        records in proptest::collection::vec(
            (
                proptest::option::of(proptest::collection::vec(any::<u8>(), 0..16)),
                proptest::option::of(proptest::collection::vec(any::<u8>(), 0..64)),
                any::<bool>(),
            ),
            1..24,
        ),
        async_send in any::<bool>(),
    ) {
        let broker = MemoryBroker::new();
        let (mut bolt, collector) = prepare(&byte_array_configuration(&broker, async_send, false), &broker);

        let mut expected_acked = BTreeSet::new();
        let mut expected_failed = BTreeSet::new();
        for (i, (key, message, tick)) in records.iter().enumerate() {
            let id = i as u64;
            let record = if *tick {
                expected_acked.insert(RecordId::new(id));
                Record::tick(id)
            } else {
                let mut fields = Vec::new();
                if let Some(key) = key {
                    fields.push(("key", FieldValue::from(key.clone())));
                }
                match message {
                    Some(message) => {
                        fields.push(("message", FieldValue::from(message.clone())));
                        expected_acked.insert(RecordId::new(id));
                    }
                    None => {
                        expected_failed.insert(RecordId::new(id));
                    }
                }
                Record::new(id, fields)
            };
            bolt.execute(&record);
        }

        prop_assert!(collector.wait_for(records.len(), TIMEOUT));
        bolt.cleanup();

        let dispositions = collector.dispositions();
        prop_assert_eq!(dispositions.len(), records.len());
        let settled = dispositions.iter().map(Disposition::record_id).collect::<BTreeSet<_>>();
        prop_assert_eq!(settled.len(), records.len());
        prop_assert_eq!(collector.acked().into_iter().collect::<BTreeSet<_>>(), expected_acked);
        prop_assert_eq!(collector.failed().into_iter().collect::<BTreeSet<_>>(), expected_failed);

        let published = broker.messages(TOPIC);
        let expected_published = records
            .iter()
            .filter(|(_, message, tick)| !tick && message.is_some())
            .count();
        prop_assert_eq!(published.len(), expected_published);
    }
}
