//! Mailbox overflow / slow-consumer drop policy: a subscription bounded
//! to 1000 messages that receives 2000 deliveries keeps the first 1000
//! and drops the rest, counting every drop.

use petrel_core::subscription::{MailboxLimits, Subscription};
use petrel_core::Message;

#[test]
fn overflow_keeps_the_first_1000_and_drops_the_rest() {
    let sub = Subscription::new(
        1,
        "orders.new",
        None,
        MailboxLimits { max_msgs: 1000, max_bytes: -1 },
    );

    for i in 0..2000u32 {
        let msg = Message::new("orders.new", None, i.to_be_bytes().to_vec(), None, 1);
        sub.enqueue(msg);
    }

    assert_eq!(sub.pending_msgs(), 1000);
    assert_eq!(sub.dropped_count(), 1000);

    let first = sub.try_pop().expect("first queued message survives");
    assert_eq!(u32::from_be_bytes(first.payload().try_into().unwrap()), 0);
}
