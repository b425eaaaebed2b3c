// Copyright (c) 2018 The supervisord maintainers and/or applicable contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Elements of `left` that do not appear in `right`, preserving order.
pub fn sub(left: &[String], right: &[String]) -> Vec<String> {
    left.iter()
        .filter(|s| !right.contains(s))
        .cloned()
        .collect()
}

/// True if both slices hold the same elements, ignoring order.
pub fn is_same_string_set(left: &[String], right: &[String]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter().all(|s| right.contains(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sub_keeps_only_left_elements() {
        let left = strings(&["a", "b", "c"]);
        let right = strings(&["b"]);
        assert_eq!(sub(&left, &right), strings(&["a", "c"]));
        assert!(sub(&right, &left).is_empty());
    }

    #[test]
    fn same_string_set_ignores_order() {
        assert!(is_same_string_set(
            &strings(&["p1", "p2"]),
            &strings(&["p2", "p1"])
        ));
        assert!(!is_same_string_set(&strings(&["p1"]), &strings(&["p2"])));
        assert!(!is_same_string_set(&strings(&["p1"]), &strings(&[])));
    }
}
