//! Controller identification and namespace discovery against the in-process
//! target: the tail-chained Identify loop, skip rules, queue-creation
//! failure handling and publication.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;

use common::{deliver_irqs, FakePci, FakeTarget, NsConfig, TargetConfig};
use flint_nvme::ctrl::PublishFn;
use flint_nvme::hw::TestDmaSpace;
use flint_nvme::{Controller, CtrlConfig, Namespace};

type Published = Rc<RefCell<Vec<Rc<Namespace>>>>;

fn setup(config: TargetConfig) -> (Rc<Controller>, FakeTarget) {
    setup_with(config, CtrlConfig::default())
}

fn setup_with(config: TargetConfig, ctrl_config: CtrlConfig) -> (Rc<Controller>, FakeTarget) {
    let target = FakeTarget::new(config);
    let pci = FakePci::new(target.clone());
    let dma = TestDmaSpace::new();
    let ctl = Controller::new(Box::new(pci), dma, ctrl_config).unwrap();
    (ctl, target)
}

/// The production publish flow: wrap, register, hand back to the
/// controller. The tests record instead of wrapping.
fn collect(ctl: &Rc<Controller>, published: &Published) -> PublishFn {
    let ctl = ctl.clone();
    let published = published.clone();
    Rc::new(move |ns: Rc<Namespace>| {
        ctl.add_ns(ns.clone());
        published.borrow_mut().push(ns);
    })
}

fn discover(ctl: &Rc<Controller>) -> Published {
    let published: Published = Rc::new(RefCell::new(Vec::new()));
    ctl.identify(collect(ctl, &published)).unwrap();
    deliver_irqs(ctl);
    published
}

fn published_nsids(published: &Published) -> Vec<u32> {
    published.borrow().iter().map(|ns| ns.nsid()).collect()
}

#[test]
fn publishes_only_usable_namespaces() {
    // ns 1 healthy, ns 2 inactive, ns 3 metadata-bearing: exactly one
    // namespace comes up, but all three are identified, in order.
    let (ctl, target) = setup(TargetConfig {
        namespaces: vec![
            NsConfig::healthy(1000),
            NsConfig::inactive(),
            NsConfig::with_metadata(1000),
        ],
        ..Default::default()
    });

    let published = discover(&ctl);

    assert_eq!(published_nsids(&published), vec![1]);
    let state = target.state.borrow();
    assert_eq!(
        state.identify_log,
        vec![(1, 0), (0, 1), (0, 2), (0, 3)],
        "identify controller, then each namespace in order"
    );
    assert_eq!(state.created_cqs, vec![1]);
    assert_eq!(state.created_sqs, vec![1]);
}

#[test]
fn publishes_every_healthy_namespace() {
    let (ctl, target) = setup(TargetConfig {
        namespaces: vec![
            NsConfig::healthy(100),
            NsConfig::healthy(200),
            NsConfig::healthy(300),
        ],
        ..Default::default()
    });

    let published = discover(&ctl);

    assert_eq!(published_nsids(&published), vec![1, 2, 3]);
    for (i, ns) in published.borrow().iter().enumerate() {
        assert_eq!(ns.lba_size(), 512);
        assert_eq!(ns.nsze(), 100 * (i as u64 + 1));
        assert_eq!(ns.qid(), i as u16 + 1);
    }
    let state = target.state.borrow();
    assert_eq!(state.created_cqs, vec![1, 2, 3]);
    assert_eq!(state.created_sqs, vec![1, 2, 3]);
}

#[test]
fn out_of_range_lba_format_is_skipped() {
    let (ctl, _) = setup(TargetConfig {
        namespaces: vec![NsConfig {
            flbas: 5, // only format 0 exists
            ..NsConfig::healthy(1000)
        }],
        ..Default::default()
    });

    let published = discover(&ctl);
    assert_eq!(published_nsids(&published), Vec::<u32>::new());
}

#[test]
fn iocq_failure_dooms_namespace_but_chain_advances() {
    let (ctl, target) = setup(TargetConfig {
        namespaces: vec![NsConfig::healthy(100), NsConfig::healthy(200)],
        ..Default::default()
    });
    target.state.borrow_mut().fail_create_cq.insert(1);

    let published = discover(&ctl);

    assert_eq!(published_nsids(&published), vec![2]);
    let state = target.state.borrow();
    assert_eq!(state.identify_log, vec![(1, 0), (0, 1), (0, 2)]);
    // The failed CQ never gets a matching SQ.
    assert_eq!(state.created_sqs, vec![2]);
}

#[test]
fn iosq_failure_dooms_namespace_but_chain_advances() {
    let (ctl, target) = setup(TargetConfig {
        namespaces: vec![NsConfig::healthy(100), NsConfig::healthy(200)],
        ..Default::default()
    });
    target.state.borrow_mut().fail_create_sq.insert(1);

    let published = discover(&ctl);

    assert_eq!(published_nsids(&published), vec![2]);
    let state = target.state.borrow();
    // Both completion queues were created; only the second namespace's
    // submission queue was accepted.
    assert_eq!(state.created_cqs, vec![1, 2]);
    assert_eq!(state.identify_log, vec![(1, 0), (0, 1), (0, 2)]);
}

#[test]
fn identify_failure_terminates_the_chain() {
    let (ctl, target) = setup(TargetConfig {
        namespaces: vec![
            NsConfig::healthy(100),
            NsConfig::healthy(200),
            NsConfig::healthy(300),
        ],
        ..Default::default()
    });
    target.state.borrow_mut().fail_identify_ns.insert(2);

    let published = discover(&ctl);

    // Namespace 1 made it; the failing Identify for 2 stops everything
    // after it.
    assert_eq!(published_nsids(&published), vec![1]);
    let state = target.state.borrow();
    assert_eq!(state.identify_log, vec![(1, 0), (0, 1), (0, 2)]);
}

#[test]
fn serial_is_trimmed_at_the_first_space() {
    let (ctl, _) = setup(TargetConfig {
        serial: "SN123".into(), // padded to 20 bytes by the target
        ..Default::default()
    });

    discover(&ctl);
    assert_eq!(ctl.serial(), "SN123");
}

#[test]
fn namespace_attributes_are_extracted() {
    let (ctl, _) = setup(TargetConfig {
        namespaces: vec![NsConfig {
            nsattr: 1,          // write protected
            dlfeat: 0b0000_1000, // DEALLOCWZ
            ..NsConfig::healthy(4096)
        }],
        ..Default::default()
    });

    let published = discover(&ctl);
    let published = published.borrow();
    let ns = published.first().unwrap();
    assert!(ns.read_only());
    assert!(ns.dlfeat().deallocwz());
}

#[test]
fn sgl_use_requires_gate_and_controller_support() {
    let (ctl, _) = setup(TargetConfig {
        sgls: 0x2, // controller supports SGLs
        ..Default::default()
    });
    discover(&ctl);
    assert!(ctl.supports_sgl());

    let (ctl, _) = setup(TargetConfig::default()); // SGLS = 0
    discover(&ctl);
    assert!(!ctl.supports_sgl());

    let (ctl, _) = setup_with(
        TargetConfig {
            sgls: 0x2,
            ..Default::default()
        },
        CtrlConfig { use_sgls: false },
    );
    discover(&ctl);
    assert!(!ctl.supports_sgl());
}

#[test]
fn no_namespaces_publishes_nothing() {
    let (ctl, target) = setup(TargetConfig {
        namespaces: vec![],
        ..Default::default()
    });

    let published = discover(&ctl);
    assert_eq!(published_nsids(&published), Vec::<u32>::new());
    assert_eq!(target.state.borrow().identify_log, vec![(1, 0)]);
}
